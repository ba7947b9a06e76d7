pub mod handlers;

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::common::dialer::{Dialer, TcpDial};
use crate::common::Credentials;
use crate::config::Config;
use crate::proxy::outbound::socks5::UpstreamProxy;
use crate::proxy::{OutboundConnector, SessionContext};
use crate::router::Router;

use handlers::AppState;

pub use crate::proxy::{accept_inbound_session, handle_stream_request};

pub struct App {
    state: AppState,
    bind_addr: String,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let credentials = Arc::new(Credentials::from_config(&config.credentials, SystemTime::now()));
        credentials.warm_up();

        let router = Arc::new(Router::new(&config.ban.hosts, &config.upstream.patterns)?);
        let dialer: Arc<dyn TcpDial> = Arc::new(Dialer::new(config.dialer.clone()));
        let upstream = match config.upstream.address.as_deref() {
            Some(addr) => Some(Arc::new(UpstreamProxy::parse(addr)?)),
            None => None,
        };
        let translator = crate::dns::build_translator(&config.translation)?;

        let connector = OutboundConnector::new(dialer, router.clone())
            .with_relays(config.relay.pool.clone(), config.relay.default.clone())
            .with_upstream(upstream)
            .with_translator(translator);

        let disabled = config.disabled_header_protocols();
        if !disabled.is_empty() {
            info!(protocols = ?disabled, "protocols disabled");
        }
        let session = SessionContext::new(credentials, router, connector)
            .with_disabled(disabled)
            .with_limits(config.limits.clone());

        let stream_path: String = config.credentials.uuid.chars().take(8).collect();
        let state = AppState {
            session,
            stream_transport: config.stream_transport_enabled(),
            stream_path: Arc::from(format!("/{}", stream_path)),
            redirect: config.server.redirect.as_deref().filter(|s| !s.is_empty()).map(Arc::from),
        };

        Ok(Self {
            state,
            bind_addr: format!("{}:{}", config.server.listen, config.server.port),
        })
    }

    /// 所有路径都交给同一个入口处理
    pub fn router(&self) -> axum::Router {
        axum::Router::new()
            .fallback(handlers::gateway)
            .with_state(self.state.clone())
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.bind_addr))?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        info!(
            addr = %local,
            stream_transport = self.state.stream_transport,
            "EdgeGate listening"
        );
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}
