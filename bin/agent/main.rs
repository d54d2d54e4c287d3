//! Node agent CLI
//!
//! Runs this machine as a marketplace instance and manages its image cache.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use node_agent::{
    shutdown_signal, Agent, AgentConfig, AgentError, ContainerEngine, DockerEngine, HttpControlPlane,
    ImageCache, LocalState, DEFAULT_JOB_TIMEOUT_SECS,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

// ==================== CLI ====================

#[derive(Parser, Debug)]
#[command(name = "node-agent")]
#[command(about = "Run this machine as a compute marketplace instance")]
struct Cli {
    /// Control-plane base URL (overrides agent.toml)
    #[arg(long, env = "NODE_AGENT_URL")]
    url: Option<String>,

    /// Local data directory (default: ~/.node-agent)
    #[arg(long, env = "NODE_AGENT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the instance and process jobs until stopped
    Start {
        /// Seconds a job may run before it is reported as timed out
        #[arg(long, default_value_t = DEFAULT_JOB_TIMEOUT_SECS, env = "NODE_AGENT_JOB_TIMEOUT")]
        job_timeout: u64,
    },
    /// Pull the auxiliary images the agent depends on
    DownloadDependencies,
    /// Manage the images cached on this instance
    Image {
        #[command(subcommand)]
        action: ImageCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ImageCommand {
    /// Pull an image and add it to this instance
    Download {
        #[arg(long)]
        registry_path: String,
    },
    /// Remove an image from disk and from this instance
    Clean {
        #[arg(long)]
        registry_path: String,
    },
    /// Re-pull every image associated with this instance
    UpdateAll,
}

// ==================== Setup ====================

struct Session {
    state: LocalState,
    config: AgentConfig,
}

impl Session {
    fn load(cli: &Cli) -> Result<Self> {
        let data_dir = match &cli.data_dir {
            Some(dir) => dir.clone(),
            None => LocalState::default_dir()?,
        };
        let state = LocalState::new(data_dir);

        let mut config = AgentConfig::load(state.data_dir())
            .with_context(|| format!("Failed to load config from {}", state.data_dir().display()))?;
        if let Some(url) = &cli.url {
            config.control_plane_url = url.clone();
        }

        Ok(Self { state, config })
    }

    fn control_plane(&self) -> Result<Arc<HttpControlPlane>> {
        let token = self.state.token()?;
        let client = HttpControlPlane::new(
            &self.config.control_plane_url,
            &token,
            self.config.request_timeout(),
        )?;
        Ok(Arc::new(client))
    }

    fn image_cache(&self) -> Result<ImageCache> {
        let instance_id = self.state.instance_id()?;
        Ok(ImageCache::new(
            self.control_plane()?,
            Arc::new(connect_engine()?),
            instance_id,
        ))
    }
}

fn connect_engine() -> Result<DockerEngine> {
    DockerEngine::connect().context("Is the Docker daemon running in your machine?")
}

// ==================== Commands ====================

async fn cmd_start(session: &Session, job_timeout: u64) -> Result<i32> {
    let instance_id = session.state.instance_id()?;
    let control_plane = session.control_plane()?;
    let engine = Arc::new(connect_engine()?);

    info!(
        "Starting instance {} against {}",
        instance_id, session.config.control_plane_url
    );

    let agent = Agent::new(
        control_plane,
        engine,
        session.config.clone(),
        &instance_id,
        Duration::from_secs(job_timeout),
    );

    let exit = agent.run(shutdown_signal()).await;
    match exit.cause {
        AgentError::Interrupted => info!("Instance {} interrupted", instance_id),
        ref cause => error!("{}", cause),
    }
    Ok(exit.exit_code())
}

async fn cmd_download_dependencies(session: &Session) -> Result<i32> {
    let engine = connect_engine()?;
    engine.ping().await?;

    for image in &session.config.execution.dependency_images {
        let logs = engine
            .pull_image(image)
            .await
            .with_context(|| format!("Failed to pull {}", image))?;
        print!("{}", logs);
    }
    Ok(0)
}

async fn cmd_image(session: &Session, action: &ImageCommand) -> Result<i32> {
    let cache = session.image_cache()?;

    match action {
        ImageCommand::Download { registry_path } => {
            print!("{}", cache.download(registry_path).await?);
            println!("Image {} downloaded", registry_path);
        }
        ImageCommand::Clean { registry_path } => {
            print!("{}", cache.clean(registry_path).await?);
            println!("Image {} removed", registry_path);
        }
        ImageCommand::UpdateAll => {
            let summary = cache.update_all().await?;
            for image in &summary.updated {
                println!("Updated {}", image);
            }
            for (image, reason) in &summary.failed {
                println!("Failed {}: {}", image, reason);
            }
            if !summary.failed.is_empty() {
                return Ok(1);
            }
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,node_agent=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let session = Session::load(&cli)?;

    let code = match &cli.command {
        Commands::Start { job_timeout } => cmd_start(&session, *job_timeout).await?,
        Commands::DownloadDependencies => cmd_download_dependencies(&session).await?,
        Commands::Image { action } => cmd_image(&session, action).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
