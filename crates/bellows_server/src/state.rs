//! Shared server state and component wiring.

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::hub::{Hub, HubCallbacks};
use crate::intake::Intake;
use crate::log_fanout::LogFanout;
use crate::relay::RelayHub;
use crate::status::StatusPoster;
use bellows_storage::{LogStore, Storage};
use std::sync::Arc;

/// Everything a request handler can reach.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub storage: Storage,
    pub logs: Arc<LogStore>,
    pub hub: Arc<Hub>,
    pub dispatcher: Arc<Dispatcher>,
    pub fanout: Arc<LogFanout>,
    pub relays: Arc<RelayHub>,
    pub auth: Arc<Authenticator>,
    pub intake: Arc<Intake>,
}

impl AppState {
    /// Build and wire all components. The hub's transition callbacks feed the
    /// dispatcher's wake signal: new capacity (a worker connecting or
    /// finishing a job) immediately drives another assignment pass.
    pub fn new(
        config: ServerConfig,
        storage: Storage,
        logs: Arc<LogStore>,
        poster: Arc<dyn StatusPoster>,
    ) -> Self {
        let hub = Arc::new(Hub::new());
        let fanout = Arc::new(LogFanout::new());
        let dispatcher = Dispatcher::new(
            hub.clone(),
            storage.clone(),
            logs.clone(),
            fanout.clone(),
            poster,
        );
        let intake = Arc::new(Intake::new(storage.clone(), dispatcher.clone()));
        let auth = Arc::new(Authenticator::new(
            storage.clone(),
            config.token_secret.clone(),
        ));

        {
            let on_connected = dispatcher.clone();
            let on_finished = dispatcher.clone();
            hub.set_callbacks(HubCallbacks {
                on_connected: Some(Box::new(move |_| on_connected.wake())),
                on_disconnected: None,
                on_job_started: None,
                on_job_finished: Some(Box::new(move |_, _| on_finished.wake())),
            });
        }

        Self {
            config: Arc::new(config),
            storage,
            logs,
            hub,
            dispatcher,
            fanout,
            relays: Arc::new(RelayHub::new()),
            auth,
            intake,
        }
    }
}
