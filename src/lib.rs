pub mod backup;
pub mod chats;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod llm;
pub mod reconstruct;
pub mod translator;

use db::Database;
use events::{HostEvent, TranslatorEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use translator::Translator;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub translator: Arc<Translator>,
    pub tx: broadcast::Sender<TranslatorEvent>,
    pub host_events: mpsc::Sender<HostEvent>,
}
