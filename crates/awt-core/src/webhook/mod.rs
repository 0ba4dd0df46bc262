//! Durable at-least-once webhook delivery: job queue, HMAC signing,
//! exponential backoff, and host-permission preflight.

pub mod dispatcher;
pub mod types;

pub use dispatcher::{sign, Deliverer, DeliveryRequest, DeliveryResponse, HttpDeliverer, WebhookDispatcher};
pub use types::{Connector, ConnectorSet, Job, JobResult, JobStatus, WebhookError};
