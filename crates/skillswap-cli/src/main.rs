use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use skillswap_catalog::{
    build_backend, load_catalog_config, sign_in, sign_up, CatalogController, CatalogView, ClientConfig,
    FetchOutcome, Notice, NoticeLevel,
};
use skillswap_core::{Registration, Session};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "skillswap")]
#[command(about = "Browse and trade skills with the skill swap catalog")]
struct Cli {
    /// Serve fixture data instead of calling the backend.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Browse(BrowseArgs),
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Register(RegisterArgs),
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Debug, Default, Args)]
struct BrowseArgs {
    #[arg(long, default_value = "")]
    search: String,
    #[arg(long, default_value = "")]
    availability: String,
    #[arg(long, default_value_t = 1)]
    page: usize,
}

#[derive(Debug, Args)]
struct RegisterArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    #[arg(long)]
    confirm_password: Option<String>,
    #[arg(long, default_value = "")]
    location: String,
    /// Repeat for each skill you can teach.
    #[arg(long = "offer")]
    offer: Vec<String>,
    #[arg(long = "want")]
    want: Vec<String>,
    #[arg(long = "available")]
    available: Vec<String>,
}

impl RegisterArgs {
    fn into_registration(self) -> Registration {
        let mut registration = Registration {
            name: self.name,
            email: self.email,
            confirm_password: self.confirm_password.unwrap_or_else(|| self.password.clone()),
            password: self.password,
            location: self.location,
            ..Registration::default()
        };
        for skill in &self.offer {
            registration.add_skill_offered(skill);
        }
        for skill in &self.want {
            registration.add_skill_wanted(skill);
        }
        for slot in &self.available {
            registration.toggle_availability(slot);
        }
        registration
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .try_init()?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut client = ClientConfig::from_env();
    init_logging(&client.log_level)?;

    if let Some(path) = cli.fixtures {
        client.fixtures_path = Some(path);
    }

    match cli.command.unwrap_or(Commands::Browse(BrowseArgs::default())) {
        Commands::Browse(args) => browse(&client, args).await?,
        Commands::Login { email, password } => {
            let config = load_catalog_config(&client.catalog_config_path)?;
            let backend = build_backend(&client)?;
            let session = sign_in(&*backend, &config, &email, &password)
                .await
                .context("login failed")?;
            println!("{}", describe_session(&session));
        }
        Commands::Register(args) => {
            let config = load_catalog_config(&client.catalog_config_path)?;
            let backend = build_backend(&client)?;
            let session = sign_up(&*backend, &config, &args.into_registration())
                .await
                .context("registration failed")?;
            println!("registered; {}", describe_session(&session));
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(client.web_port);
            skillswap_web::serve(&client, port).await?;
        }
    }

    Ok(())
}

async fn browse(client: &ClientConfig, args: BrowseArgs) -> Result<()> {
    let config = load_catalog_config(&client.catalog_config_path)?;
    let backend = build_backend(client)?;
    let mut controller = CatalogController::new(config);

    let outcome = controller.mount(&*backend).await;
    debug!(?outcome, "catalog mounted");
    controller.set_search_term(args.search);
    controller.set_availability_filter(args.availability);
    controller.select_page(args.page);

    for notice in controller.drain_notices() {
        eprintln!("{}", format_notice(&notice));
    }
    print!("{}", render_view(&controller.view(&Session::anonymous())));

    if let FetchOutcome::FetchFailed { reason } = outcome {
        anyhow::bail!("catalog fetch failed: {reason}");
    }
    Ok(())
}

fn describe_session(session: &Session) -> String {
    match session.user() {
        Some(user) if session.is_admin() => format!("signed in as {} <{}> (admin)", user.name, user.email),
        Some(user) => format!("signed in as {} <{}>", user.name, user.email),
        None => "not signed in".to_string(),
    }
}

fn format_notice(notice: &Notice) -> String {
    match notice.level {
        NoticeLevel::Error => format!("error: {}", notice.message),
        NoticeLevel::Success => notice.message.clone(),
    }
}

fn render_view(view: &CatalogView) -> String {
    let mut out = String::new();
    for card in &view.cards {
        let record = &card.record;
        out.push_str(&format!(
            "[{}] {} ({:.1}){}\n    offers: {}\n    wants:  {}\n    available: {}\n",
            card.key,
            record.name,
            record.rating,
            record
                .location
                .as_deref()
                .map(|l| format!(" - {l}"))
                .unwrap_or_default(),
            record.skills_offered.join(", "),
            record.skills_wanted.join(", "),
            record.availability.join(", "),
        ));
    }
    if view.cards.is_empty() {
        out.push_str("No users found matching your criteria.\n");
    }
    out.push_str(&format!(
        "page {}/{} - showing {} of {} matches\n",
        view.current_page, view.total_pages, view.showing, view.total_matches
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillswap_catalog::{CatalogConfig, FetchTrigger};
    use skillswap_core::{CatalogRecord, NormalizedBatch};

    #[test]
    fn register_args_default_confirmation_to_password() {
        let args = RegisterArgs {
            name: "Nia".into(),
            email: "nia@example.com".into(),
            password: "secret1".into(),
            confirm_password: None,
            location: String::new(),
            offer: vec!["Knitting".into(), "Knitting".into()],
            want: vec!["Rust".into()],
            available: vec!["Evenings".into()],
        };
        let registration = args.into_registration();
        assert_eq!(registration.confirm_password, "secret1");
        assert_eq!(registration.skills_offered, vec!["Knitting"]);
        assert!(registration.validate().is_ok());
    }

    #[test]
    fn render_view_lists_cards_and_page_footer() {
        let mut controller = CatalogController::new(CatalogConfig::default());
        let ticket = controller.begin_fetch(FetchTrigger::Mount);
        let record = CatalogRecord {
            id: Some("1".into()),
            location: Some("Austin, TX".into()),
            skills_offered: vec!["Spanish".into()],
            rating: 4.9,
            ..CatalogRecord::new("Elena Rodriguez")
        };
        controller.complete_fetch(
            ticket,
            Ok(NormalizedBatch {
                records: vec![record],
                malformed: Vec::new(),
            }),
        );
        let text = render_view(&controller.view(&Session::anonymous()));
        assert!(text.contains("[1] Elena Rodriguez (4.9) - Austin, TX"));
        assert!(text.ends_with("page 1/1 - showing 1 of 1 matches\n"));

        controller.set_search_term("nobody");
        let empty = render_view(&controller.view(&Session::anonymous()));
        assert!(empty.contains("No users found"));
    }
}
