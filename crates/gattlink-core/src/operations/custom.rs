//! Caller-defined operations

use crate::platform::GattLink;
use crate::queue::{Operation, OperationEmitter, Priority, QueueRelease};
use crate::router::GattEventRouter;
use async_trait::async_trait;
use core::fmt;
use std::sync::Arc;

/// Operation written by application code against the raw link
///
/// The same obligations as for built-in operations apply: release the
/// queue on every exit path and never leave a platform call in flight when
/// releasing.
#[async_trait]
pub trait CustomOperation: Send + 'static {
    type Output: Send + 'static;

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    async fn run(
        self: Box<Self>,
        link: Arc<dyn GattLink>,
        router: Arc<GattEventRouter>,
        emitter: OperationEmitter<Self::Output>,
        release: QueueRelease,
    );
}

/// Binds a custom operation to the link it will run against
pub(crate) struct CustomAdapter<C> {
    operation: C,
    link: Arc<dyn GattLink>,
    router: Arc<GattEventRouter>,
}

impl<C: CustomOperation> CustomAdapter<C> {
    pub(crate) fn new(operation: C, link: Arc<dyn GattLink>, router: Arc<GattEventRouter>) -> Self {
        Self { operation, link, router }
    }
}

impl<C> fmt::Debug for CustomAdapter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CustomOperation({})", core::any::type_name::<C>())
    }
}

#[async_trait]
impl<C: CustomOperation> Operation for CustomAdapter<C> {
    type Output = C::Output;

    fn priority(&self) -> Priority {
        self.operation.priority()
    }

    async fn run(self: Box<Self>, emitter: OperationEmitter<C::Output>, release: QueueRelease) {
        let CustomAdapter { operation, link, router } = *self;
        Box::new(operation).run(link, router, emitter, release).await;
    }
}
