pub mod account;

use crate::modules::auth::lifecycle::TokenLifecycleManager;
use crate::modules::persistence::account_db::AccountStore;
use crate::proxy::upstream::client::UpstreamClient;
use std::sync::Arc;

/// Services the chat front-end calls into.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AccountStore>,
    pub auth: Arc<TokenLifecycleManager>,
    pub client: Arc<UpstreamClient>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn AccountStore>,
        auth: Arc<TokenLifecycleManager>,
        client: Arc<UpstreamClient>,
    ) -> Self {
        Self {
            store,
            auth,
            client,
        }
    }
}
