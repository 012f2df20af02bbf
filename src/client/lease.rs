use super::RealtimeClient;

/// One reference on the shared connection, released on drop
#[derive(Debug)]
pub struct ConnectionLease {
    client: RealtimeClient,
    released: bool,
}

impl ConnectionLease {
    pub(super) fn acquire(client: RealtimeClient) -> Self {
        client.request_connection();
        Self {
            client,
            released: false,
        }
    }

    pub fn client(&self) -> &RealtimeClient {
        &self.client
    }

    /// Release now instead of on drop
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.client.release_connection();
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.release_once();
    }
}
