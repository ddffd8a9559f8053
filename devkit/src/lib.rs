/*!
# catdog DevKit - Doubles et utilitaires de test

Shared by the workspace's integration tests:
- `MockSink`: records everything a module would push to the relay
- `RecordingObserver`: records link connectivity transitions
- free ports, polling with a deadline, idempotent tracing setup
*/

pub mod mock_sink;
pub mod test_utils;

pub use mock_sink::{MockSink, RecordingObserver};
pub use test_utils::{free_tcp_port, free_udp_port, init_tracing, wait_until, wait_until_async};
