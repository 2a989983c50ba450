//! Environment Commands

use anyhow::Result;
use clap::Subcommand;
use lumen_common::{Environment, Page};
use lumen_engine::Lumen;
use serde::Serialize;
use std::collections::HashMap;

use crate::output::{
    format_time, print_info, print_item, print_list, print_success, short_id, OutputFormat,
    TableDisplay,
};

#[derive(Subcommand)]
pub enum EnvCommands {
    /// Register a site under test
    Add {
        /// Unique environment name
        name: String,

        /// Base URL, e.g. https://example.com
        base_url: String,
    },

    /// List environments
    List,

    /// Discover pages and merge them into the environment's page tree
    Crawl {
        /// Environment ID
        id: String,

        /// Only print the discovered URLs
        #[arg(long)]
        dry_run: bool,
    },

    /// List the environment's page tree
    Pages {
        /// Environment ID
        id: String,

        /// Hide structural pages
        #[arg(long)]
        navigable: bool,
    },
}

#[derive(Serialize)]
pub struct EnvironmentDisplay {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub created_at: String,
}

impl From<Environment> for EnvironmentDisplay {
    fn from(env: Environment) -> Self {
        Self {
            id: env.id,
            name: env.name,
            base_url: env.base_url,
            created_at: format_time(env.created_at),
        }
    }
}

impl TableDisplay for EnvironmentDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Base URL", "Created"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.base_url.clone(),
            self.created_at.clone(),
        ]
    }
}

#[derive(Serialize)]
pub struct PageDisplay {
    pub id: String,
    pub path: String,
    pub name: String,
    pub parent: Option<String>,
    pub navigable: bool,
}

impl PageDisplay {
    fn new(page: Page, paths: &HashMap<String, String>) -> Self {
        Self {
            parent: page.parent_id.as_ref().and_then(|id| paths.get(id).cloned()),
            id: page.id,
            path: page.path,
            name: page.name,
            navigable: page.navigable,
        }
    }
}

impl TableDisplay for PageDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Path", "Name", "Parent", "Navigable"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            short_id(&self.id).to_string(),
            self.path.clone(),
            self.name.clone(),
            self.parent.clone().unwrap_or_else(|| "-".to_string()),
            if self.navigable { "✓" } else { "" }.to_string(),
        ]
    }
}

#[derive(Serialize)]
struct UrlDisplay {
    url: String,
}

impl TableDisplay for UrlDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["URL"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.url.clone()]
    }
}

fn page_list(lumen: &Lumen, environment_id: &str, navigable_only: bool) -> Result<Vec<PageDisplay>> {
    let pages = lumen.db().list_pages(environment_id)?;
    let paths: HashMap<String, String> = pages.iter().map(|p| (p.id.clone(), p.path.clone())).collect();
    let mut displays: Vec<PageDisplay> = pages
        .into_iter()
        .filter(|p| p.navigable || !navigable_only)
        .map(|p| PageDisplay::new(p, &paths))
        .collect();
    displays.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(displays)
}

pub async fn execute(cmd: EnvCommands, lumen: &Lumen, format: OutputFormat) -> Result<()> {
    match cmd {
        EnvCommands::Add { name, base_url } => {
            let env = lumen.add_environment(&name, &base_url)?;
            print_success(&format!("Environment '{}' added", env.name));
            print_item(&EnvironmentDisplay::from(env), format);
        }

        EnvCommands::List => {
            let envs: Vec<EnvironmentDisplay> = lumen
                .db()
                .list_environments()?
                .into_iter()
                .map(EnvironmentDisplay::from)
                .collect();
            print_list(&envs, format);
        }

        EnvCommands::Crawl { id, dry_run } => {
            let env = lumen.require_environment(&id)?;
            print_info(&format!("Crawling {}", env.base_url));
            if dry_run {
                let urls: Vec<UrlDisplay> = lumen
                    .crawl(&env.base_url)
                    .await?
                    .into_iter()
                    .map(|url| UrlDisplay { url })
                    .collect();
                print_list(&urls, format);
            } else {
                let created = lumen.crawl_environment(&id).await?;
                print_success(&format!("{} new pages in '{}'", created.len(), env.name));
                print_list(&page_list(lumen, &id, false)?, format);
            }
        }

        EnvCommands::Pages { id, navigable } => {
            lumen.require_environment(&id)?;
            print_list(&page_list(lumen, &id, navigable)?, format);
        }
    }

    Ok(())
}
