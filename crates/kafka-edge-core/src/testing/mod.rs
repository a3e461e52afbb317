//! Test utilities: a scriptable mock broker and a harness that runs the
//! proxy core in front of it.

pub mod harness;
pub mod mock_broker;

pub use harness::ProxyTestHarness;
pub use mock_broker::{BrokerCall, GatewayFrame, MockBroker, ResponseGenerator};
