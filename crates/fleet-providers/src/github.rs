use crate::http::send_with_retry;
use crate::paging::next_page_from_link_header;
use anyhow::Context;
use fleet_core::planner_forge::{ForgeProvider, ForgeRepo};
use reqwest::blocking::Client;
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::info;

pub const GITHUB_API: &str = "https://api.github.com";
pub const GITHUB_KIND: &str = "github";

/// Lists repositories through the GitHub REST API (also GitHub Enterprise via
/// a custom base URL).
pub struct GitHubProvider {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepoItem {
    name: String,
    clone_url: String,
    ssh_url: Option<String>,
    default_branch: Option<String>,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    fork: bool,
    #[serde(default)]
    private: bool,
    language: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pushed_at: Option<OffsetDateTime>,
}

impl From<RepoItem> for ForgeRepo {
    fn from(item: RepoItem) -> Self {
        ForgeRepo {
            name: item.name,
            namespace: Vec::new(),
            clone_url: item.clone_url,
            ssh_url: item.ssh_url,
            default_branch: item.default_branch,
            archived: item.archived,
            fork: item.fork,
            private: item.private,
            language: item.language,
            stars: item.stargazers_count,
            pushed_at: item.pushed_at,
        }
    }
}

#[derive(Clone, Copy)]
enum Owner<'a> {
    Org(&'a str),
    User(&'a str),
}

fn repos_url(base_url: &str, owner: Owner<'_>, page: u32) -> String {
    let base = base_url.trim_end_matches('/');
    match owner {
        Owner::Org(org) => format!("{base}/orgs/{org}/repos?type=all&per_page=100&page={page}"),
        Owner::User(user) => {
            format!("{base}/users/{user}/repos?type=owner&per_page=100&page={page}")
        }
    }
}

impl GitHubProvider {
    pub fn new(base_url: Option<&str>, token: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .build()
            .context("build GitHub client")?;
        Ok(Self {
            client,
            base_url: base_url.unwrap_or(GITHUB_API).to_string(),
            token,
        })
    }

    fn list(&self, owner: Owner<'_>) -> anyhow::Result<Vec<ForgeRepo>> {
        let mut repos = Vec::new();
        let mut page = Some(1);
        while let Some(current) = page {
            let url = repos_url(&self.base_url, owner, current);
            info!(page = current, "listing GitHub repos");
            let mut builder = self
                .client
                .get(&url)
                .header("Accept", "application/vnd.github+json");
            if let Some(token) = &self.token {
                builder = builder.bearer_auth(token);
            }
            let response = send_with_retry(|| builder.try_clone().context("clone request"))
                .context("call GitHub list repos")?;
            page = next_page_from_link_header(response.headers());
            let payload: Vec<RepoItem> = response.json().context("decode repos response")?;
            if payload.is_empty() {
                break;
            }
            repos.extend(payload.into_iter().map(ForgeRepo::from));
        }
        Ok(repos)
    }
}

impl ForgeProvider for GitHubProvider {
    fn kind(&self) -> &'static str {
        GITHUB_KIND
    }

    fn list_org_repos(&self, org: &str) -> anyhow::Result<Vec<ForgeRepo>> {
        self.list(Owner::Org(org))
            .with_context(|| format!("list GitHub repos for org {org}"))
    }

    fn list_user_repos(&self, user: &str) -> anyhow::Result<Vec<ForgeRepo>> {
        self.list(Owner::User(user))
            .with_context(|| format!("list GitHub repos for user {user}"))
    }
}
