use rqueue_core::Client;

#[derive(Clone)]
pub struct AppState {
    pub client: Client,
}

impl AppState {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}
