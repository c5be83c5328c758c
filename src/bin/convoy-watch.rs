//! convoy-watch: headless session client.
//!
//! Signs in against the hosted backend, resolves the friend graph, opens the
//! realtime subscription, and logs every friend-location change until
//! Ctrl-C.  Used to verify the sync core against a live backend without the
//! dashboard UI.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use clap::Parser;

use convoy::auth::RestAuth;
use convoy::colors::ColorStore;
use convoy::cvlog;
use convoy::realtime::WsRealtimeChannel;
use convoy::session::SessionController;
use convoy::store::RestStore;

/// Headless client for the convoy friend-location backend.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence.
#[derive(Parser, Debug)]
#[command(name = "convoy-watch", version, about)]
struct Cli {
    /// Backend base URL [env: CONVOY_BACKEND_URL]
    #[arg(long, short = 'u')]
    backend_url: Option<String>,

    /// Backend anon API key [env: CONVOY_API_KEY]
    #[arg(long, short = 'k')]
    api_key: Option<String>,

    /// Account email [env: CONVOY_EMAIL]
    #[arg(long, short = 'e')]
    email: Option<String>,

    /// Data directory for the local colour-override store
    /// [env: CONVOY_HOME] [default: ~/.convoy]
    #[arg(long, short = 'd')]
    data_dir: Option<PathBuf>,
}

struct Config {
    backend_url: String,
    api_key: String,
    email: String,
    password: String,
    data_dir: PathBuf,
}

impl Config {
    fn resolve(cli: Cli) -> Result<Self, &'static str> {
        let backend_url = cli
            .backend_url
            .or_else(|| std::env::var("CONVOY_BACKEND_URL").ok())
            .ok_or("backend URL required (--backend-url or CONVOY_BACKEND_URL)")?;
        let api_key = cli
            .api_key
            .or_else(|| std::env::var("CONVOY_API_KEY").ok())
            .ok_or("API key required (--api-key or CONVOY_API_KEY)")?;
        let email = cli
            .email
            .or_else(|| std::env::var("CONVOY_EMAIL").ok())
            .ok_or("email required (--email or CONVOY_EMAIL)")?;
        // Password comes from the environment only; never a CLI argument.
        let password =
            std::env::var("CONVOY_PASSWORD").map_err(|_| "CONVOY_PASSWORD must be set")?;
        let data_dir = cli
            .data_dir
            .or_else(|| std::env::var("CONVOY_HOME").ok().map(PathBuf::from))
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".convoy"))
            })
            .unwrap_or_else(|| PathBuf::from(".convoy"));
        Ok(Self {
            backend_url,
            api_key,
            email,
            password,
            data_dir,
        })
    }

    /// Derive the websocket feed URL from the backend base URL.
    fn ws_url(&self) -> String {
        let base = self.backend_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{base}")
        };
        format!("{ws_base}/realtime/v1")
    }
}

#[tokio::main]
async fn main() {
    convoy::logging::init();

    let config = match Config::resolve(Cli::parse()) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("convoy-watch: {msg}");
            std::process::exit(2);
        }
    };

    let colors = match ColorStore::open(&config.data_dir.join("colors.db")) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("convoy-watch: cannot open colour store: {e}");
            std::process::exit(1);
        }
    };

    let token = Arc::new(RwLock::new(None));
    let auth = Arc::new(RestAuth::new(
        &config.backend_url,
        &config.api_key,
        token.clone(),
    ));
    let store = Arc::new(RestStore::new(&config.backend_url, &config.api_key, token));
    let realtime = Arc::new(WsRealtimeChannel::new(config.ws_url(), &config.api_key));

    let controller = SessionController::new(auth, store, realtime, colors);

    if let Err(e) = controller.sign_in(&config.email, &config.password).await {
        eprintln!("convoy-watch: sign-in failed: {e}");
        std::process::exit(1);
    }

    let mut locations = controller.location_updates();
    let mut requests = controller.request_updates();

    cvlog!("watching friend locations; Ctrl-C to exit");
    loop {
        tokio::select! {
            changed = locations.changed() => {
                if changed.is_err() {
                    break;
                }
                let list = locations.borrow_and_update().clone();
                cvlog!("{} friend location(s):", list.len());
                for l in &list {
                    cvlog!(
                        "  {} {} at ({:.5}, {:.5}) [{}]",
                        convoy::logging::user_id(&l.friend_id),
                        l.display_name,
                        l.latitude,
                        l.longitude,
                        l.marker_color
                    );
                }
            }
            changed = requests.changed() => {
                if changed.is_err() {
                    break;
                }
                let lists = requests.borrow_and_update().clone();
                cvlog!(
                    "requests: {} received, {} sent",
                    lists.pending_received.len(),
                    lists.pending_sent.len()
                );
            }
            _ = tokio::signal::ctrl_c() => {
                cvlog!("shutting down");
                break;
            }
        }
    }

    if let Err(e) = controller.sign_out().await {
        cvlog!("sign-out failed: {}", e);
    }
}
