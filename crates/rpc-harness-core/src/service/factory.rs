//! Container factories: the pluggable part of the service-hosting runtime.

use std::fmt;
use std::sync::Arc;

use super::definition::Capabilities;
use super::hooks::{InheritContext, WorkerContextBuilder};

/// Describes a container implementation.
///
/// A factory states which entrypoint kinds it can host and how worker
/// context data is derived. Services that need more than the factory offers
/// fail at `start` with [`LifecycleError::Incompatible`].
///
/// [`LifecycleError::Incompatible`]: crate::error::LifecycleError::Incompatible
pub trait ContainerFactory: Send + Sync + fmt::Debug {
    /// Short name reported by [`ServiceContainer::kind`](super::ServiceContainer::kind).
    fn kind(&self) -> &str;

    /// Entrypoint kinds this implementation can host.
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    /// Strategy computing each worker's context data.
    fn context_builder(&self) -> Arc<dyn WorkerContextBuilder> {
        Arc::new(InheritContext)
    }
}

/// The built-in container: hosts every entrypoint kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultContainerFactory;

/// Name under which [`DefaultContainerFactory`] reports itself.
pub const DEFAULT_CONTAINER_KIND: &str = "default";

impl ContainerFactory for DefaultContainerFactory {
    fn kind(&self) -> &str {
        DEFAULT_CONTAINER_KIND
    }
}
