use kaede::{ChatService, CompletionGateway, Kaede, LocalModelClient, Settings};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Local model endpoints fixed from the environment; they win over settings
#[derive(Debug, Clone, Default)]
pub struct LocalOverrides {
    pub ollama_url: Option<String>,
    pub bridge_url: Option<String>,
}

pub struct AppState {
    pub kaede: Kaede,
    pub gateway: Arc<CompletionGateway>,
    pub settings: RwLock<Settings>,
    pub overrides: LocalOverrides,
}

impl AppState {
    pub fn new(kaede: Kaede, gateway: CompletionGateway, overrides: LocalOverrides) -> Arc<Self> {
        let settings = kaede.load_settings();
        Arc::new(Self {
            kaede,
            gateway: Arc::new(gateway),
            settings: RwLock::new(settings),
            overrides,
        })
    }

    pub async fn settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Client for the local model as currently configured
    pub async fn local_client(&self) -> LocalModelClient {
        let mut config = self.settings.read().await.local_model_config();
        if let Some(url) = &self.overrides.ollama_url {
            config.ollama_url = url.clone();
        }
        if let Some(url) = &self.overrides.bridge_url {
            config.bridge_url = Some(url.clone());
        }
        LocalModelClient::new(config)
    }

    pub async fn chat(&self) -> ChatService {
        let local = Arc::new(self.local_client().await);
        self.kaede
            .chat_service(Arc::clone(&self.gateway))
            .with_local_model(local)
    }
}
