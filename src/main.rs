mod backend;
mod chat;
mod config;
mod web;

use actix_web::{App, HttpServer, web::Data};
use dotenv::dotenv;
use log::{info, error};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tera::Tera;
use uuid::Uuid;

use backend::BackendClient;
use chat::ChatSession;
use config::Settings;
use web::routes;

struct SessionEntry {
    session: Arc<ChatSession<BackendClient>>,
    last_used: Instant,
}

type Sessions = HashMap<Uuid, SessionEntry>;

// Drop conversations nobody has touched for `idle`, unless a round is running
fn evict_idle(sessions: &mut Sessions, now: Instant, idle: Duration) {
    sessions.retain(|id, entry| {
        let keep = entry.session.is_loading() || now.duration_since(entry.last_used) < idle;
        if !keep {
            info!("Evicting idle session for conversation {}", id);
        }
        keep
    });
}

// App state structure
struct AppState {
    tera: Tera,
    settings: Settings,
    backend: BackendClient,
    sessions: Mutex<Sessions>,
}

impl AppState {
    fn new(settings: Settings, tera: Tera) -> Self {
        let backend = BackendClient::new(&settings);
        Self {
            tera,
            settings,
            backend,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    // Every caller recovers a poisoned map the same way
    fn lock_sessions(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(|e| {
            error!("Sessions mutex was poisoned, recovering");
            e.into_inner()
        })
    }

    fn session(&self, conversation_id: &Uuid) -> Option<Arc<ChatSession<BackendClient>>> {
        self.lock_sessions().get_mut(conversation_id).map(|entry| {
            entry.last_used = Instant::now();
            entry.session.clone()
        })
    }

    fn session_or_create(&self, conversation_id: Uuid) -> Arc<ChatSession<BackendClient>> {
        let now = Instant::now();
        let mut sessions = self.lock_sessions();
        evict_idle(&mut sessions, now, self.settings.session_idle);

        let entry = sessions.entry(conversation_id).or_insert_with(|| {
            info!("Creating session for conversation {}", conversation_id);
            SessionEntry {
                session: Arc::new(ChatSession::new(conversation_id.to_string(), self.backend.clone())),
                last_used: now,
            }
        });
        entry.last_used = now;
        entry.session.clone()
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    info!("Starting research chat front-end");

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    // Initialize template engine
    let mut tera = match Tera::new(&settings.templates_glob) {
        Ok(t) => t,
        Err(e) => {
            error!("Template parsing error: {}", e);
            std::process::exit(1);
        }
    };
    tera.autoescape_on(vec![".html"]);

    let bind = (settings.bind_addr.clone(), settings.port);
    let app_state = Data::new(AppState::new(settings, tera));

    info!("Listening on {}:{}", bind.0, bind.1);
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(routes::configure)
    })
    .bind(bind)?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(idle: Duration) -> AppState {
        let settings = Settings {
            fintool_host: "http://127.0.0.1:1".to_string(),
            fintool_api_key: "test-key".to_string(),
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            chat_endpoint: "v1/chat".to_string(),
            keep_last_n: 3,
            templates_glob: String::new(),
            session_idle: idle,
        };
        AppState::new(settings, Tera::default())
    }

    #[test]
    fn session_or_create_reuses_live_session() {
        let app = state(Duration::from_secs(3600));
        let id = Uuid::new_v4();

        let first = app.session_or_create(id);
        let second = app.session_or_create(id);

        assert!(Arc::ptr_eq(&first, &second));
        assert!(app.session(&id).is_some());
    }

    #[test]
    fn poisoned_session_map_is_still_served() {
        let app = state(Duration::from_secs(3600));
        let id = Uuid::new_v4();
        let created = app.session_or_create(id);

        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _sessions = app.sessions.lock().unwrap();
            panic!("handler panicked while holding the session map");
        }));
        assert!(poisoned.is_err());
        assert!(app.sessions.is_poisoned());

        let found = app.session(&id).expect("session lost after poisoning");
        assert!(Arc::ptr_eq(&created, &found));
        assert!(Arc::ptr_eq(&created, &app.session_or_create(id)));
    }

    #[test]
    fn idle_sessions_are_evicted() {
        let app = state(Duration::from_secs(60));
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        app.session_or_create(stale);

        let mut sessions = app.sessions.lock().unwrap();
        evict_idle(&mut sessions, Instant::now() + Duration::from_secs(30), Duration::from_secs(60));
        assert!(sessions.contains_key(&stale));
        evict_idle(&mut sessions, Instant::now() + Duration::from_secs(120), Duration::from_secs(60));
        assert!(!sessions.contains_key(&stale));
        drop(sessions);

        app.session_or_create(fresh);
        assert_eq!(app.sessions.lock().unwrap().len(), 1);
    }
}
