use argh::FromArgs;
use roomcam::config::report_dotenv;
use roomcam::{bot, BotConfig, SessionArguments};
use std::path::Path;

#[derive(FromArgs)]
/// Stream an RTSP camera into a conferencing room
struct Args {
    /// path to the configuration file
    #[argh(option, short = 'c', default = "String::from(\"config.yaml\")")]
    config: String,

    /// room URL, e.g. tcp://127.0.0.1:7447/lobby (default: $ROOM_URL)
    #[argh(option, short = 'r')]
    room_url: Option<String>,

    /// room token (default: $ROOM_TOKEN)
    #[argh(option, short = 't')]
    token: Option<String>,

    /// session identifier used in logs
    #[argh(option)]
    session_id: Option<String>,
}

fn load_config(path: &str) -> anyhow::Result<BotConfig> {
    let mut config = if Path::new(path).exists() {
        let config = BotConfig::from_file(path)?;
        log::info!("Loaded configuration from '{}'", path);
        config
    } else {
        log::info!("No configuration at '{}', using defaults", path);
        BotConfig::default()
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env wins over the inherited environment
    let dotenv = dotenvy::dotenv_override();

    // Initialize logging
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    report_dotenv(dotenv);

    let args: Args = argh::from_env();

    let config = match load_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            log::error!("Failed to load config from '{}': {}", args.config, e);
            std::process::exit(1);
        }
    };

    let room_url = match args.room_url.or_else(|| std::env::var("ROOM_URL").ok()) {
        Some(url) => url,
        None => {
            log::error!("No room URL given, pass --room-url or set ROOM_URL");
            std::process::exit(1);
        }
    };
    let token = args.token.or_else(|| std::env::var("ROOM_TOKEN").ok());

    if std::env::var_os("LOCAL_RUN").is_some() {
        log::warn!("_");
        log::warn!("_");
        log::warn!("Watch the camera in the room here: {}", room_url);
        log::warn!("_");
        log::warn!("_");
    }

    let args = SessionArguments {
        room_url,
        token,
        session_id: args.session_id,
        body: None,
    };

    bot(args, config).await
}
