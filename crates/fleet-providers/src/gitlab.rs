use crate::http::send_with_retry;
use crate::paging::next_page_from_header;
use anyhow::Context;
use fleet_core::planner_forge::{ForgeProvider, ForgeRepo};
use reqwest::blocking::Client;
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::info;

pub const GITLAB_API: &str = "https://gitlab.com/api/v4";
pub const GITLAB_KIND: &str = "gitlab";

/// Lists projects through the GitLab v4 API. Group listings include subgroups;
/// their path below the group becomes the repo namespace.
pub struct GitLabProvider {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectItem {
    path: String,
    path_with_namespace: String,
    http_url_to_repo: String,
    ssh_url_to_repo: Option<String>,
    default_branch: Option<String>,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    forked_from_project: Option<serde_json::Value>,
    visibility: Option<String>,
    #[serde(default)]
    star_count: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    last_activity_at: Option<OffsetDateTime>,
}

impl ProjectItem {
    fn into_forge_repo(self, owner: &str) -> ForgeRepo {
        let namespace = namespace_below(&self.path_with_namespace, owner);
        ForgeRepo {
            name: self.path,
            namespace,
            clone_url: self.http_url_to_repo,
            ssh_url: self.ssh_url_to_repo,
            default_branch: self.default_branch,
            archived: self.archived,
            fork: self.forked_from_project.is_some_and(|value| !value.is_null()),
            private: self.visibility.as_deref().is_some_and(|value| value != "public"),
            // Project listings carry no language; see `reports_language`.
            language: None,
            stars: self.star_count,
            pushed_at: self.last_activity_at,
        }
    }
}

/// Segments between `owner` and the project itself. Projects outside the owner
/// prefix keep their full parent path.
fn namespace_below(path_with_namespace: &str, owner: &str) -> Vec<String> {
    let owner = owner.trim_matches('/');
    let relative = path_with_namespace
        .strip_prefix(owner)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(path_with_namespace);
    let mut segments: Vec<String> = relative.split('/').map(str::to_string).collect();
    segments.pop();
    segments
}

#[derive(Clone, Copy)]
enum Owner<'a> {
    Group(&'a str),
    User(&'a str),
}

fn encode_path(path: &str) -> String {
    path.trim_matches('/').replace('/', "%2F")
}

fn projects_url(base_url: &str, owner: Owner<'_>, page: u32) -> String {
    let base = base_url.trim_end_matches('/');
    match owner {
        Owner::Group(group) => format!(
            "{base}/groups/{}/projects?include_subgroups=true&per_page=100&page={page}",
            encode_path(group)
        ),
        Owner::User(user) => format!(
            "{base}/users/{}/projects?per_page=100&page={page}",
            encode_path(user)
        ),
    }
}

impl GitLabProvider {
    pub fn new(base_url: Option<&str>, token: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .build()
            .context("build GitLab client")?;
        Ok(Self {
            client,
            base_url: base_url.unwrap_or(GITLAB_API).to_string(),
            token,
        })
    }

    fn list(&self, owner: Owner<'_>, owner_path: &str) -> anyhow::Result<Vec<ForgeRepo>> {
        let mut repos = Vec::new();
        let mut page = Some(1);
        while let Some(current) = page {
            let url = projects_url(&self.base_url, owner, current);
            info!(owner = owner_path, page = current, "listing GitLab projects");
            let mut builder = self.client.get(&url);
            if let Some(token) = &self.token {
                builder = builder.header("PRIVATE-TOKEN", token.as_str());
            }
            let response = send_with_retry(|| builder.try_clone().context("clone request"))
                .context("call GitLab list projects")?;
            page = next_page_from_header(response.headers(), "x-next-page");
            let payload: Vec<ProjectItem> =
                response.json().context("decode projects response")?;
            if payload.is_empty() {
                break;
            }
            repos.extend(
                payload
                    .into_iter()
                    .map(|item| item.into_forge_repo(owner_path)),
            );
        }
        Ok(repos)
    }
}

impl ForgeProvider for GitLabProvider {
    fn kind(&self) -> &'static str {
        GITLAB_KIND
    }

    fn reports_language(&self) -> bool {
        false
    }

    fn list_org_repos(&self, group: &str) -> anyhow::Result<Vec<ForgeRepo>> {
        self.list(Owner::Group(group), group)
            .with_context(|| format!("list GitLab projects for group {group}"))
    }

    fn list_user_repos(&self, user: &str) -> anyhow::Result<Vec<ForgeRepo>> {
        self.list(Owner::User(user), user)
            .with_context(|| format!("list GitLab projects for user {user}"))
    }
}
