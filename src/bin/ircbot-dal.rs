use ircbot_dal::config::{default_settings_path, load_settings, Settings};
use ircbot_dal::core::{DalError, Result};
use ircbot_dal::services::Services;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: ircbot-dal [--settings FILE] <command>

commands:
  get OPTION [CHANNEL]         read a global or channel option
  set OPTION VALUE [CHANNEL]   write a global or channel option
  unset OPTION CHANNEL         remove a channel override
  iw PREFIX                    resolve an interwiki prefix
  message NAME                 print a random message variant
  install-schema               create missing bot tables";

#[derive(Debug, PartialEq)]
enum Command {
    Get { option: String, channel: Option<String> },
    Set { option: String, value: String, channel: Option<String> },
    Unset { option: String, channel: String },
    Interwiki { prefix: String },
    Message { name: String },
    InstallSchema,
}

fn parse_args(args: &[String]) -> Result<(Option<PathBuf>, Command)> {
    let mut settings = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--settings" {
            let path = iter
                .next()
                .ok_or_else(|| DalError::Config("--settings needs a file".to_string()))?;
            settings = Some(PathBuf::from(path));
        } else {
            rest.push(arg.clone());
        }
    }

    let command = match rest.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["get", option] => Command::Get { option: option.to_string(), channel: None },
        ["get", option, channel] => Command::Get {
            option: option.to_string(),
            channel: Some(channel.to_string()),
        },
        ["set", option, value] => Command::Set {
            option: option.to_string(),
            value: value.to_string(),
            channel: None,
        },
        ["set", option, value, channel] => Command::Set {
            option: option.to_string(),
            value: value.to_string(),
            channel: Some(channel.to_string()),
        },
        ["unset", option, channel] => Command::Unset {
            option: option.to_string(),
            channel: channel.to_string(),
        },
        ["iw", prefix] => Command::Interwiki { prefix: prefix.to_string() },
        ["message", name] => Command::Message { name: name.to_string() },
        ["install-schema"] => Command::InstallSchema,
        _ => return Err(DalError::Config(USAGE.to_string())),
    };
    Ok((settings, command))
}

fn settings_from(path: Option<PathBuf>) -> Result<Settings> {
    match path {
        Some(path) => load_settings(path),
        None => match default_settings_path().filter(|p| p.exists()) {
            Some(path) => load_settings(path),
            None => Ok(Settings::default()),
        },
    }
}

fn run(services: &Services, command: Command) -> Result<()> {
    match command {
        Command::Get { option, channel: None } => {
            println!("{}", services.options.global(&option));
        }
        Command::Get { option, channel: Some(channel) } => {
            println!("{}", services.options.local(&channel, &option)?);
        }
        Command::Set { option, value, channel } => {
            let stored = match &channel {
                Some(channel) => services.options.set_local(channel, &option, Some(&value)),
                None => services.options.set_global(&option, &value),
            };
            if !stored {
                return Err(DalError::Query(format!("could not store option '{}'", option)));
            }
        }
        Command::Unset { option, channel } => {
            if !services.options.set_local(&channel, &option, None) {
                return Err(DalError::Query(format!(
                    "could not remove override of '{}' in {}",
                    option, channel
                )));
            }
        }
        Command::Interwiki { prefix } => {
            println!("{}", services.database.get_iw_url(&prefix)?);
        }
        Command::Message { name } => {
            println!("{}", services.messages.get(&name));
        }
        Command::InstallSchema => services.database.install_schema()?,
    }
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (settings_path, command) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    let settings = match settings_from(settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load settings: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // RUST_LOG wins over the settings file
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting ircbot-dal...");

    let result = Services::from_settings(&settings).and_then(|services| run(&services, command));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}
