use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use clap::{Parser, Subcommand};
use fingertip::{
    app::App,
    browser::EnrollmentStatus,
    config::{APP_DIR_ENV, Config, LogFormat, resolve_app_dir},
    enrollment::{DisableReport, EnableOutcome, EnrollmentState},
    logging::{self, LogSettings},
    onboarding,
    probe::{DebugInfo, Probe, RECENT_VISIT_WINDOW},
};

#[derive(Debug, Parser)]
#[command(name = "fingertip", version)]
struct Cli {
    /// Application directory holding the CA, the store and `fingertip.toml`.
    #[arg(long, global = true, env = APP_DIR_ENV)]
    app_dir: Option<PathBuf>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Command {
    /// Serve the onboarding pages, certificate and PAC script.
    Serve,
    /// Route this machine through the proxy and trust the CA.
    Enable {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    /// Undo everything `enable` changed.
    Disable {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    /// Show enrollment state.
    Status,
    /// Manage the local certificate authority.
    Ca {
        #[command(subcommand)]
        action: CaCommand,
    },
    /// Persist the resolver backend choice.
    Backend { name: String },
}

#[derive(Debug, Subcommand, Clone, Copy, PartialEq, Eq)]
enum CaCommand {
    /// Print the CA certificate path.
    Path,
    /// Replace the CA with a freshly generated one.
    Regenerate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let app_dir = resolve_app_dir(cli.app_dir.as_deref())?;
    let config = Config::load(&app_dir)?;
    let fallback_format = match cli.command {
        Command::Serve => LogFormat::Json,
        _ => LogFormat::Pretty,
    };
    logging::init(LogSettings::resolve(
        &config,
        cli.log_level.as_deref(),
        fallback_format,
    )?)?;
    let app = App::open(&app_dir, config)?;

    match cli.command {
        Command::Serve => serve(&app).await?,
        Command::Enable { yes } => {
            app.ca.get_or_create()?;
            let enrollment = app.enrollment();
            let prompt = format!(
                "Trust the Fingertip CA and route this machine through {}?",
                enrollment.pac_url()
            );
            if !yes && !confirm(&prompt, &mut io::stdin().lock(), &mut io::stderr())? {
                println!("aborted");
                return Ok(());
            }
            let outcome = enrollment.enable()?;
            println!("{}", enable_summary(&outcome));
            if matches!(outcome, EnableOutcome::Enabled { .. }) {
                let proxy_url = app.config.proxy.url();
                let info = onboarding::fetch_debug_info(&proxy_url).await;
                if let Some(hint) = onboarding_hint(info, &proxy_url, SystemTime::now()) {
                    println!("{hint}");
                }
            }
        }
        Command::Disable { yes } => {
            if !yes
                && !confirm(
                    "Remove the Fingertip proxy configuration and CA trust?",
                    &mut io::stdin().lock(),
                    &mut io::stderr(),
                )?
            {
                println!("aborted");
                return Ok(());
            }
            let report = app.enrollment().disable()?;
            println!("{}", disable_summary(&report));
        }
        Command::Status => {
            let state = app.enrollment().status();
            println!(
                "{}",
                status_summary(
                    &state,
                    &app.backend(),
                    &app.ca.paths().cert_path,
                    &app.config.proxy.url()
                )
            );
        }
        Command::Ca { action } => match action {
            CaCommand::Path => println!("{}", app.ca.paths().cert_path.display()),
            CaCommand::Regenerate => {
                let paths = app.ca.regenerate()?;
                if app.enrollment().status().auto_config_enabled {
                    eprintln!("the new CA is not trusted yet; run `fingertip enable` again");
                }
                println!("{}", paths.cert_path.display());
            }
        },
        Command::Backend { name } => {
            let name = name.trim();
            if name.is_empty() {
                anyhow::bail!("backend name must not be empty");
            }
            app.enrollment().set_backend(name)?;
            println!("backend set to `{name}`");
        }
    }

    Ok(())
}

async fn serve(app: &App) -> anyhow::Result<()> {
    app.ca.get_or_create()?;
    let authority = app.ca.load()?;
    let probe = Arc::new(Probe::new());
    let state = Arc::new(app.onboarding_state(&authority, probe));
    let bind = app.config.proxy.socket_addr()?;
    let server = onboarding::serve(bind, state).await?;
    eprintln!(
        "{}",
        startup_summary(app, server.listen_addr, &authority.paths.cert_path)
    );
    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}

fn startup_summary(app: &App, listen_addr: std::net::SocketAddr, cert_path: &Path) -> String {
    let config_path = app
        .config
        .source_path()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "defaults".to_owned());
    format!(
        "fingertip {} listening on http://{listen_addr} (app_dir={}, config={config_path}, ca_cert={}, backend={})",
        fingertip::VERSION,
        app.paths.dir.display(),
        cert_path.display(),
        app.backend(),
    )
}

fn confirm(prompt: &str, input: &mut impl BufRead, output: &mut impl Write) -> anyhow::Result<bool> {
    write!(output, "{prompt} [y/N] ")?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

fn enable_summary(outcome: &EnableOutcome) -> String {
    match outcome {
        EnableOutcome::ManualSetup { setup_url } => format!(
            "automatic setup is not available on this platform; follow {setup_url}"
        ),
        EnableOutcome::Enabled { browsers } => {
            let mut lines = vec!["enabled".to_owned()];
            for report in browsers {
                for profile in &report.profiles {
                    let status = match profile.status {
                        EnrollmentStatus::Installed => "configured",
                        EnrollmentStatus::Conflict => {
                            "left untouched (existing proxy settings conflict)"
                        }
                        EnrollmentStatus::None => "skipped",
                    };
                    lines.push(format!(
                        "  {} {}: {status}",
                        report.browser,
                        profile.profile.display()
                    ));
                }
            }
            lines.join("\n")
        }
    }
}

/// Points at the onboarding page unless a browser already has it open.
fn onboarding_hint(
    info: anyhow::Result<DebugInfo>,
    proxy_url: &str,
    now: SystemTime,
) -> Option<String> {
    match info {
        Ok(info) if info.visited_within(RECENT_VISIT_WINDOW, now) => None,
        Ok(_) => Some(format!("open {proxy_url}/ in your browser to finish setup")),
        Err(err) => {
            tracing::debug!("onboarding server not reachable: {err:#}");
            Some(format!(
                "run `fingertip serve`, then open {proxy_url}/ in your browser to finish setup"
            ))
        }
    }
}

fn disable_summary(report: &DisableReport) -> String {
    if report.is_clean() {
        return "disabled".to_owned();
    }
    let mut lines = vec!["disabled (some steps need manual cleanup)".to_owned()];
    lines.extend(report.failures.iter().map(|failure| format!("  {failure}")));
    lines.join("\n")
}

fn status_summary(
    state: &EnrollmentState,
    backend: &str,
    cert_path: &Path,
    proxy_url: &str,
) -> String {
    let yes_no = |value: bool| if value { "yes" } else { "no" };
    let cert_trusted = state.cert_trusted.map(yes_no).unwrap_or("unknown");
    format!(
        "supported: {}\nauto_config: {}\ncert_trusted: {cert_trusted}\nbackend: {backend}\nca_cert: {}\nproxy: {proxy_url}",
        yes_no(state.supported),
        if state.auto_config_enabled {
            "enabled"
        } else {
            "disabled"
        },
        cert_path.display(),
    )
}
