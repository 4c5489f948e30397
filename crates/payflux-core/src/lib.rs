pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod payment;
pub mod step;
pub mod traits;

pub use config::AppConfig;
pub use error::{FlowError, Result};
pub use event::{BatchItem, BatchReport, EngineEvent, EventBus};
pub use flow::{FlowEvent, FlowFilter, FlowRecord, FlowStatus, FlowSummary};
pub use payment::{
    AllocationStatus, AssetAllocation, AssetReconciliation, CaptureReceipt, ExchangeOrder,
    LedgerEntry, OrderAck, OrderFill, OrderRequest, OrderSide, OrderStatus, PaymentState,
    ReconciliationDetails, ReconciliationStatus,
};
pub use step::{Step, StepBranch, StepResult, StepStatus};
pub use traits::{ExchangeClient, FlowStore, PaymentGateway};
