use std::sync::Arc;

use fanout::ChannelHub;
use server_api::ApiContext;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    /// Also the publisher behind `api.fanout`.
    pub(crate) hub: Arc<ChannelHub>,
}
