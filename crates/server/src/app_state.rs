use server_api::ApiContext;

use crate::hub::ChatHub;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) hub: ChatHub,
}
