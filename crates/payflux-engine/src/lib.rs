pub mod control;
pub mod executor;
pub mod pipeline;
pub mod reconcile;
pub mod recovery;
pub mod registry;
pub mod runtime;

pub use control::{BatchOperation, ControlPlane, FlowListing, ListPage, OperationResult, Statistics};
pub use executor::{HandlerRegistry, StepContext, StepExecutor, StepHandler, StepOutput};
pub use pipeline::{
    payment_flow, register_payment_handlers, AllocationRequest, ChargeNotice, PaperExchange,
    PaperGateway,
};
pub use reconcile::reconcile;
pub use recovery::{RecoveryManager, RecoveryReport};
pub use registry::RuntimeRegistry;
pub use runtime::FlowRuntime;
