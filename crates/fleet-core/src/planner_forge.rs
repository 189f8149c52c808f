use crate::cancel::CancelToken;
use crate::model::{Action, ActionType, AuthConfig, Plan, RepoSpec};
use crate::paths::{PathLayout, repo_path, resolve_path};
use crate::planner::{OrphanScan, PlanOptions, Planner, is_git_repo, scan_orphans};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const FORGE_PLANNER: &str = "forge";

/// A repository as listed by a hosting platform.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ForgeRepo {
    pub name: String,
    /// Subgroup segments between the listed owner and the repo, outermost first.
    pub namespace: Vec<String>,
    pub clone_url: String,
    pub ssh_url: Option<String>,
    pub default_branch: Option<String>,
    pub archived: bool,
    pub fork: bool,
    pub private: bool,
    pub language: Option<String>,
    pub stars: u64,
    pub pushed_at: Option<OffsetDateTime>,
}

impl ForgeRepo {
    /// `group/sub/name` relative to the listed owner.
    pub fn full_name(&self) -> String {
        let mut parts = self.namespace.clone();
        parts.push(self.name.clone());
        parts.join("/")
    }
}

pub trait ForgeProvider: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Whether listed repos carry `language`. When false, language filters are ignored.
    fn reports_language(&self) -> bool {
        true
    }

    fn list_org_repos(&self, org: &str) -> anyhow::Result<Vec<ForgeRepo>>;

    fn list_user_repos(&self, user: &str) -> anyhow::Result<Vec<ForgeRepo>>;
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForgeTarget {
    Org(String),
    User(String),
}

impl ForgeTarget {
    fn owner(&self) -> &str {
        match self {
            ForgeTarget::Org(owner) | ForgeTarget::User(owner) => owner,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeFilter {
    pub include_archived: bool,
    pub include_forks: bool,
    /// Private repos are listed by default; set to `Some(false)` to drop them.
    pub include_private: Option<bool>,
    /// Case-insensitive; empty keeps every language.
    pub languages: Vec<String>,
    pub min_stars: Option<u64>,
    pub max_stars: Option<u64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub pushed_after: Option<OffsetDateTime>,
}

impl ForgeFilter {
    pub fn matches(&self, repo: &ForgeRepo) -> bool {
        if repo.archived && !self.include_archived {
            return false;
        }
        if repo.fork && !self.include_forks {
            return false;
        }
        if repo.private && !self.include_private.unwrap_or(true) {
            return false;
        }
        if !self.languages.is_empty() {
            let Some(language) = repo.language.as_deref() else {
                return false;
            };
            if !self
                .languages
                .iter()
                .any(|wanted| wanted.eq_ignore_ascii_case(language))
            {
                return false;
            }
        }
        if self.min_stars.is_some_and(|min| repo.stars < min) {
            return false;
        }
        if self.max_stars.is_some_and(|max| repo.stars > max) {
            return false;
        }
        if let Some(after) = self.pushed_after
            && !repo.pushed_at.is_some_and(|pushed| pushed >= after)
        {
            return false;
        }
        true
    }
}

/// Plans from a hosting-platform listing.
///
/// Desired repos whose name (or `group/name`) matches a listed repo act as
/// overrides for path, branch, strategy, remotes and auth; a disabled override
/// removes the repo from the plan.
pub struct ForgePlanner {
    provider: Arc<dyn ForgeProvider>,
    target: ForgeTarget,
    root: PathBuf,
    layout: PathLayout,
    filter: ForgeFilter,
    use_ssh: bool,
    auth: Option<AuthConfig>,
}

impl ForgePlanner {
    pub fn new(provider: Arc<dyn ForgeProvider>, target: ForgeTarget, root: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            target,
            root: root.into(),
            layout: PathLayout::default(),
            filter: ForgeFilter::default(),
            use_ssh: false,
            auth: None,
        }
    }

    pub fn layout(mut self, layout: PathLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn filter(mut self, filter: ForgeFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn use_ssh(mut self, use_ssh: bool) -> Self {
        self.use_ssh = use_ssh;
        self
    }

    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    fn list(&self) -> anyhow::Result<Vec<ForgeRepo>> {
        let kind = self.provider.kind();
        match &self.target {
            ForgeTarget::Org(org) => self
                .provider
                .list_org_repos(org)
                .with_context(|| format!("list {kind} repos for org {org}")),
            ForgeTarget::User(user) => self
                .provider
                .list_user_repos(user)
                .with_context(|| format!("list {kind} repos for user {user}")),
        }
    }

    fn to_spec(&self, listed: &ForgeRepo, path: PathBuf, desired: Option<&RepoSpec>) -> RepoSpec {
        let url = match (&listed.ssh_url, self.use_ssh) {
            (Some(ssh_url), true) => ssh_url.clone(),
            _ => listed.clone_url.clone(),
        };
        let auth = self.auth.clone().map(|mut auth| {
            if auth.provider.is_none() {
                auth.provider = Some(self.provider.kind().to_string());
            }
            auth
        });
        let mut spec = RepoSpec {
            name: listed.full_name(),
            url,
            path,
            branch: listed.default_branch.clone(),
            auth,
            ..RepoSpec::default()
        };
        if let Some(desired) = desired {
            if !desired.url.is_empty() {
                spec.url = desired.url.clone();
            }
            if !desired.path.as_os_str().is_empty() {
                spec.path = desired.path.clone();
            }
            if desired.branch.is_some() {
                spec.branch = desired.branch.clone();
            }
            if desired.auth.is_some() {
                spec.auth = desired.auth.clone();
            }
            spec.strategy = desired.strategy;
            spec.remotes = desired.remotes.clone();
            spec.enabled = desired.enabled;
        }
        spec
    }
}

fn find_override<'a>(desired: &'a [RepoSpec], listed: &ForgeRepo) -> Option<&'a RepoSpec> {
    let full_name = listed.full_name();
    desired
        .iter()
        .find(|repo| repo.name == full_name || repo.name == listed.name)
}

impl Planner for ForgePlanner {
    fn name(&self) -> &'static str {
        FORGE_PLANNER
    }

    fn plan(
        &self,
        ctx: &CancelToken,
        desired: &[RepoSpec],
        options: &PlanOptions,
    ) -> anyhow::Result<Plan> {
        self.layout.validate()?;
        ctx.check()?;
        let listed = self.list()?;
        let total = listed.len();
        let filter = if !self.filter.languages.is_empty() && !self.provider.reports_language() {
            warn!(
                provider = self.provider.kind(),
                languages = ?self.filter.languages,
                "provider does not report languages; language filter ignored"
            );
            ForgeFilter {
                languages: Vec::new(),
                ..self.filter.clone()
            }
        } else {
            self.filter.clone()
        };

        let mut actions = Vec::new();
        let mut listed_paths = Vec::new();
        let mut claimed = HashSet::new();
        for repo in listed.iter().filter(|repo| filter.matches(repo)) {
            ctx.check()?;
            let path = repo_path(&self.root, &repo.namespace, &repo.name, &self.layout)?;
            let spec = self.to_spec(repo, path, find_override(desired, repo));
            if !claimed.insert(resolve_path(&spec.path)) {
                warn!(
                    repo = %spec.name,
                    path = %spec.path.display(),
                    "duplicate target path; keeping first repo"
                );
                continue;
            }
            listed_paths.push(spec.path.clone());
            if !spec.enabled() {
                debug!(repo = %spec.name, "disabled by override; excluded");
                continue;
            }
            let (kind, reason) = if is_git_repo(&spec.path) {
                (ActionType::Update, "listed and present locally")
            } else {
                (ActionType::Clone, "listed but missing locally")
            };
            let strategy = options.strategy_for(&spec);
            actions.push(Action::new(spec, kind, strategy, reason, FORGE_PLANNER));
        }
        info!(
            provider = self.provider.kind(),
            owner = %self.target.owner(),
            listed = total,
            planned = actions.len(),
            "forge listing planned"
        );

        if options.cleanup_orphans {
            let roots = if options.cleanup_roots.is_empty() {
                vec![self.root.clone()]
            } else {
                options.cleanup_roots.clone()
            };
            let targets: Vec<&Path> = listed_paths.iter().map(PathBuf::as_path).collect();
            actions.extend(scan_orphans(
                ctx,
                &OrphanScan {
                    roots: &roots,
                    targets: &targets,
                    require_marker: true,
                    strategy: options.default_strategy.unwrap_or_default(),
                    planner: FORGE_PLANNER,
                },
            )?);
        }

        Ok(Plan::new(actions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FleetError;
    use crate::model::Strategy;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use time::Duration;

    struct FakeForge {
        repos: Vec<ForgeRepo>,
        languages: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeForge {
        fn new(repos: Vec<ForgeRepo>) -> Arc<Self> {
            Arc::new(Self {
                repos,
                languages: true,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl ForgeProvider for FakeForge {
        fn kind(&self) -> &'static str {
            "gitlab"
        }

        fn reports_language(&self) -> bool {
            self.languages
        }

        fn list_org_repos(&self, org: &str) -> anyhow::Result<Vec<ForgeRepo>> {
            self.calls.lock().unwrap().push(format!("org:{org}"));
            Ok(self.repos.clone())
        }

        fn list_user_repos(&self, user: &str) -> anyhow::Result<Vec<ForgeRepo>> {
            self.calls.lock().unwrap().push(format!("user:{user}"));
            Ok(self.repos.clone())
        }
    }

    fn listed(name: &str, namespace: &[&str]) -> ForgeRepo {
        ForgeRepo {
            name: name.into(),
            namespace: namespace.iter().map(|s| s.to_string()).collect(),
            clone_url: format!("https://gitlab.com/grp/{name}.git"),
            ssh_url: Some(format!("git@gitlab.com:grp/{name}.git")),
            default_branch: Some("main".into()),
            language: Some("Rust".into()),
            stars: 10,
            ..ForgeRepo::default()
        }
    }

    #[test]
    fn filter_applies_every_criterion() {
        let now = OffsetDateTime::now_utc();
        let base = ForgeRepo {
            pushed_at: Some(now),
            ..listed("a", &[])
        };
        let filter = ForgeFilter {
            languages: vec!["rust".into()],
            min_stars: Some(5),
            max_stars: Some(50),
            pushed_after: Some(now - Duration::days(7)),
            ..ForgeFilter::default()
        };
        assert!(filter.matches(&base));
        assert!(!filter.matches(&ForgeRepo { archived: true, ..base.clone() }));
        assert!(!filter.matches(&ForgeRepo { fork: true, ..base.clone() }));
        assert!(!filter.matches(&ForgeRepo { stars: 1, ..base.clone() }));
        assert!(!filter.matches(&ForgeRepo { stars: 99, ..base.clone() }));
        assert!(!filter.matches(&ForgeRepo {
            language: Some("Go".into()),
            ..base.clone()
        }));
        assert!(!filter.matches(&ForgeRepo {
            pushed_at: Some(now - Duration::days(30)),
            ..base.clone()
        }));
        assert!(!filter.matches(&ForgeRepo { pushed_at: None, ..base.clone() }));

        let private = ForgeRepo { private: true, ..base.clone() };
        assert!(filter.matches(&private));
        let public_only = ForgeFilter {
            include_private: Some(false),
            ..ForgeFilter::default()
        };
        assert!(!public_only.matches(&private));
    }

    #[test]
    fn classifies_by_local_marker_and_layout() {
        let tmp = TempDir::new().unwrap();
        let forge = FakeForge::new(vec![listed("api", &["backend"]), listed("web", &[])]);
        fs::create_dir_all(tmp.path().join("backend__api").join(".git")).unwrap();

        let planner = ForgePlanner::new(forge.clone(), ForgeTarget::Org("grp".into()), tmp.path())
            .layout(PathLayout::Flattened {
                separator: "__".into(),
            });
        let plan = planner
            .plan(&CancelToken::new(), &[], &PlanOptions::default())
            .unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.actions[0].kind, ActionType::Update);
        assert_eq!(plan.actions[0].repo.name, "backend/api");
        assert_eq!(plan.actions[0].repo.path, tmp.path().join("backend__api"));
        assert_eq!(plan.actions[1].kind, ActionType::Clone);
        assert_eq!(plan.actions[1].repo.branch.as_deref(), Some("main"));
        assert_eq!(forge.calls.lock().unwrap().as_slice(), ["org:grp"]);
    }

    #[test]
    fn unsafe_separator_fails_before_listing() {
        let forge = FakeForge::new(vec![listed("api", &[])]);
        let planner = ForgePlanner::new(forge.clone(), ForgeTarget::User("me".into()), "/srv")
            .layout(PathLayout::Flattened {
                separator: "/".into(),
            });
        let err = planner
            .plan(&CancelToken::new(), &[], &PlanOptions::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FleetError>(),
            Some(FleetError::UnsafeSeparator(_))
        ));
        assert!(forge.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn overrides_apply_and_disabled_repos_are_excluded() {
        let tmp = TempDir::new().unwrap();
        let forge = FakeForge::new(vec![listed("api", &[]), listed("legacy", &[])]);
        let mut api = RepoSpec::new("api", "", "");
        api.strategy = Some(Strategy::Pull);
        api.branch = Some("develop,main".into());
        let mut legacy = RepoSpec::new("legacy", "", "");
        legacy.enabled = Some(false);

        let planner = ForgePlanner::new(forge, ForgeTarget::User("me".into()), tmp.path())
            .use_ssh(true)
            .auth(AuthConfig {
                token: Some("tok".into()),
                ..AuthConfig::default()
            });
        let plan = planner
            .plan(&CancelToken::new(), &[api, legacy], &PlanOptions::default())
            .unwrap();

        assert_eq!(plan.len(), 1);
        let action = &plan.actions[0];
        assert_eq!(action.strategy, Strategy::Pull);
        assert_eq!(action.repo.branch.as_deref(), Some("develop,main"));
        assert_eq!(action.repo.url, "git@gitlab.com:grp/api.git");
        assert_eq!(
            action.repo.auth.as_ref().and_then(|auth| auth.provider.as_deref()),
            Some("gitlab")
        );
    }

    #[test]
    fn orphans_require_a_repository_marker() {
        let tmp = TempDir::new().unwrap();
        let forge = FakeForge::new(vec![listed("api", &[])]);
        fs::create_dir_all(tmp.path().join("api").join(".git")).unwrap();
        fs::create_dir_all(tmp.path().join("gone").join(".git")).unwrap();
        fs::create_dir_all(tmp.path().join("scratch")).unwrap();

        let planner = ForgePlanner::new(forge, ForgeTarget::Org("grp".into()), tmp.path());
        let options = PlanOptions {
            cleanup_orphans: true,
            ..PlanOptions::default()
        };
        let plan = planner.plan(&CancelToken::new(), &[], &options).unwrap();
        let deletes: Vec<_> = plan
            .actions
            .iter()
            .filter(|action| action.kind == ActionType::Delete)
            .map(|action| action.repo.path.clone())
            .collect();
        assert_eq!(deletes, vec![tmp.path().join("gone")]);
        assert_eq!(plan.count(ActionType::Update), 1);
    }

    #[test]
    fn same_name_in_two_subgroups_keeps_first_target() {
        let tmp = TempDir::new().unwrap();
        let forge = FakeForge::new(vec![listed("api", &["a"]), listed("api", &["b"])]);
        let planner = ForgePlanner::new(forge, ForgeTarget::Org("grp".into()), tmp.path());
        let plan = planner
            .plan(&CancelToken::new(), &[], &PlanOptions::default())
            .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan.actions[0].repo.name, "a/api");
        assert_eq!(plan.actions[0].repo.path, tmp.path().join("api"));

        let nested = ForgePlanner::new(
            FakeForge::new(vec![listed("api", &["a"]), listed("api", &["b"])]),
            ForgeTarget::Org("grp".into()),
            tmp.path(),
        )
        .layout(PathLayout::Nested)
        .plan(&CancelToken::new(), &[], &PlanOptions::default())
        .unwrap();
        assert_eq!(nested.len(), 2);
    }

    #[test]
    fn override_path_colliding_with_listed_repo_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let forge = FakeForge::new(vec![listed("api", &[]), listed("web", &[])]);
        let web = RepoSpec::new("web", "", tmp.path().join("api"));
        let plan = ForgePlanner::new(forge, ForgeTarget::Org("grp".into()), tmp.path())
            .plan(&CancelToken::new(), &[web], &PlanOptions::default())
            .unwrap();
        let names: Vec<_> = plan.actions.iter().map(|action| action.repo.name.as_str()).collect();
        assert_eq!(names, vec!["api"]);
    }

    #[test]
    fn language_filter_is_ignored_when_provider_has_no_languages() {
        let tmp = TempDir::new().unwrap();
        let repos = vec![
            ForgeRepo { language: None, ..listed("api", &[]) },
            ForgeRepo { language: None, archived: true, ..listed("old", &[]) },
        ];
        let filter = ForgeFilter {
            languages: vec!["rust".into()],
            ..ForgeFilter::default()
        };
        let blind = Arc::new(FakeForge {
            repos: repos.clone(),
            languages: false,
            calls: Mutex::new(Vec::new()),
        });
        let plan = ForgePlanner::new(blind, ForgeTarget::Org("grp".into()), tmp.path())
            .filter(filter.clone())
            .plan(&CancelToken::new(), &[], &PlanOptions::default())
            .unwrap();
        let names: Vec<_> = plan.actions.iter().map(|action| action.repo.name.as_str()).collect();
        assert_eq!(names, vec!["api"]);

        let plan = ForgePlanner::new(FakeForge::new(repos), ForgeTarget::Org("grp".into()), tmp.path())
            .filter(filter)
            .plan(&CancelToken::new(), &[], &PlanOptions::default())
            .unwrap();
        assert!(plan.is_empty());
    }
}
