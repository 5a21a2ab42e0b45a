// cs-test-utils: Shared test utilities for the clousocket suite.
//
// Provides an in-process mock RESP key/value store and a raw RESP test
// client for integration testing of the server, store pool, and session
// runtime.

pub mod mock_store;
pub mod test_client;

pub use mock_store::MockStoreServer;
pub use test_client::TestClient;
