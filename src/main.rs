use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use matchpoint::matchmaking::{GameDescriptor, MatchRequest, Matchmaker, OnlinePlayMode};
use matchpoint::user::{Identity, StaticCredentials, UserProfile};
use matchpoint::{MatchmakingConfig, UdpTransport};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "matchpoint=info".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    let mode = match args[1].as_str() {
        "ranked" => OnlinePlayMode::Ranked,
        "unranked" => OnlinePlayMode::Unranked,
        "direct" => OnlinePlayMode::Direct,
        "teams" => OnlinePlayMode::Teams,
        other => {
            eprintln!("Error: Invalid mode '{other}'");
            eprintln!();
            print_usage(&args[0]);
            std::process::exit(1);
        }
    };

    let uid = env::var("MATCHPOINT_UID").context("MATCHPOINT_UID environment variable not set")?;
    let play_key =
        env::var("MATCHPOINT_PLAY_KEY").context("MATCHPOINT_PLAY_KEY environment variable not set")?;
    let connect_code = env::var("MATCHPOINT_CONNECT_CODE")
        .context("MATCHPOINT_CONNECT_CODE environment variable not set")?;
    let display_name =
        env::var("MATCHPOINT_DISPLAY_NAME").unwrap_or_else(|_| connect_code.clone());

    let identity = Identity {
        uid,
        play_key,
        connect_code,
    };
    let profile = UserProfile {
        alternate: identity.clone(),
        identity,
        display_name,
    };

    let mut config = MatchmakingConfig::default();
    if let Ok(host) = env::var("MATCHPOINT_SERVER") {
        config.directory_host = host;
    }
    if let Ok(port) = env::var("MATCHPOINT_SERVER_PORT") {
        config.directory_port = port.parse().context("Invalid MATCHPOINT_SERVER_PORT")?;
    }

    let game = GameDescriptor {
        id: env::var("MATCHPOINT_GAME_ID").unwrap_or_else(|_| "GALE01".into()),
        external_id: env::var("MATCHPOINT_GAME_EXTERNAL_ID").unwrap_or_default(),
        revision: 0,
        kind: "DolphinNetplay".into(),
        name: env::var("MATCHPOINT_GAME_NAME").unwrap_or_else(|_| "Melee".into()),
    };
    let mut request = MatchRequest::new(game, mode);
    if mode == OnlinePlayMode::Direct {
        request.connect_code = args
            .get(2)
            .cloned()
            .context("direct mode needs an opponent connect code argument")?;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let credentials = Arc::new(StaticCredentials::logged_in(profile));
        let mut matchmaker = Matchmaker::new(config, UdpTransport, credentials);

        println!("Searching ({:?})...", mode);
        let outcome = matchmaker.start(request).await?;
        match outcome.await {
            Ok(Ok(result)) => {
                println!("Connected!");
                println!("  Opponent   : {}", result.remote_connect_code);
                println!("  Decider    : {}", result.is_decider);
                println!("  Local port : {}", result.local_port);
                println!("  Stages     : {:?}", result.session.assignment.stages);
                result
                    .session
                    .close(std::time::Duration::from_secs(3))
                    .await;
            }
            Ok(Err(e)) => eprintln!("Search failed: {e}"),
            Err(_) => eprintln!("Search ended without a result"),
        }
        matchmaker.close().await;
        anyhow::Ok(())
    })?;

    Ok(())
}

fn print_usage(program_name: &str) {
    eprintln!("matchpoint - matchmaking and peer connection client");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  {program_name} ranked                    # Queue for a ranked match");
    eprintln!("  {program_name} unranked                  # Queue for an unranked match");
    eprintln!("  {program_name} direct <connect_code>     # Connect to a specific opponent");
    eprintln!("  {program_name} teams                     # Queue for a teams match");
    eprintln!();
    eprintln!("Required environment variables:");
    eprintln!("  MATCHPOINT_UID            Account id");
    eprintln!("  MATCHPOINT_PLAY_KEY       Account play key");
    eprintln!("  MATCHPOINT_CONNECT_CODE   Your connect code, e.g. ABC#123");
    eprintln!();
    eprintln!("Optional environment variables:");
    eprintln!("  MATCHPOINT_DISPLAY_NAME   Name shown to opponents");
    eprintln!("  MATCHPOINT_SERVER         Directory server host");
    eprintln!("  MATCHPOINT_SERVER_PORT    Directory server port");
    eprintln!("  MATCHPOINT_GAME_ID        Game id to queue for");
    eprintln!("  MATCHPOINT_GAME_NAME      Game name string");
    eprintln!("  RUST_LOG                  Log filter, e.g. matchpoint=debug");
}
