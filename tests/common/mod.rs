//! Shared fixture for integration tests: a bootstrap file and settings in a
//! temp directory, wired through the public composition root.

use ircbot_dal::config::Settings;
use ircbot_dal::core::db::Value;
use ircbot_dal::services::Services;
use std::fs;
use tempfile::TempDir;

pub struct BotFixture {
    pub services: Services,
    _dir: TempDir,
}

impl BotFixture {
    pub fn new(configure: impl FnOnce(&mut Settings)) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let bootstrap = dir.path().join("hmbot.cfg");
        fs::write(&bootstrap, "localhost\n3306\nhelpmebot\nsecret\nhelpmebot\n")
            .expect("Failed to write bootstrap file");

        let mut settings = Settings::default();
        settings.database.bootstrap_file = bootstrap;
        settings.database.data_dir = dir.path().to_path_buf();
        settings.database.install_schema = true;
        settings.reconnect.initial_delay_ms = 1;
        settings.reconnect.budget_ms = 20;
        settings.reconnect.poll_interval_ms = 1;
        configure(&mut settings);

        let services = Services::from_settings(&settings).expect("Failed to build services");
        seed(&services);
        BotFixture {
            services,
            _dir: dir,
        }
    }
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn seed(services: &Services) {
    let db = &services.database;
    for (name, value) in [("silence", "false"), ("baseWiki", "enwiki"), ("autoLink", "true")] {
        db.try_insert("configuration", &[Value::Null, text(name), text(value)])
            .expect("Failed to seed configuration");
    }
    for name in ["##helpmebot", "#wikipedia-en-help"] {
        db.try_insert("channel", &[Value::Null, text(name), Value::Integer(1)])
            .expect("Failed to seed channels");
    }
    db.try_insert(
        "interwikis",
        &[Value::Null, text("w"), text("https://en.wikipedia.org/wiki/$1")],
    )
    .expect("Failed to seed interwikis");
}
