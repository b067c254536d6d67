pub mod event;
pub mod pricing;
pub mod processor;

pub use event::{EventLineItem, PaymentConfirmedEvent, WebhookEnvelope};
pub use pricing::{FixedRateBreakdown, PriceBreakdown, UpstreamBreakdown};
pub use processor::{SettlementProcessor, SettlementReport, SettlementStatus};
