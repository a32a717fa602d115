pub mod amount;
pub mod chain;
pub mod event;
pub mod payment;
pub mod snapshot;

pub use amount::Amount;
pub use chain::{ChainId, EscrowRef, ExternalOpId, PositionRef, TxRef, external_op_id};
pub use event::{EventKind, LedgerEvent};
pub use payment::{Distribution, PartyId, Payment, PaymentId, PaymentState, StrategyId};
pub use snapshot::StrategySnapshot;
