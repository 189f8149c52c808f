use crate::cancel::CancelToken;
use crate::diagnostic::{
    DiagnosticOptions, HealthReport, HealthStatus, HealthSummary, NetworkStatus, RepoHealth,
    WorkTreeStatus, classify_divergence, classify_health, classify_network, recommend,
    work_tree_status,
};
use crate::error::FleetError;
use crate::git::{GitCli, RepoInspector};
use crate::model::{RepoSpec, now_rfc3339};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Fleet health checks over a fixed pool of worker threads.
pub struct DiagnosticExecutor {
    inspector: Arc<dyn RepoInspector>,
}

impl Default for DiagnosticExecutor {
    fn default() -> Self {
        Self::new(Arc::new(GitCli::new()))
    }
}

impl DiagnosticExecutor {
    pub fn new(inspector: Arc<dyn RepoInspector>) -> Self {
        Self { inspector }
    }

    /// Checks every repo. The report holds one entry per input, in input order;
    /// repos left unchecked after cancellation are reported as errors.
    pub fn check_health(
        &self,
        ctx: &CancelToken,
        repos: &[RepoSpec],
        options: &DiagnosticOptions,
    ) -> anyhow::Result<HealthReport> {
        ctx.check()?;
        let started = Instant::now();
        let total = repos.len();
        let mut slots: Vec<Option<RepoHealth>> = vec![None; total];

        if total > 0 {
            let workers = options.workers().min(total);
            info!(repos = total, workers, skip_fetch = options.skip_fetch, "checking fleet health");
            let inspector = self.inspector.as_ref();
            let (work_tx, work_rx) = mpsc::sync_channel::<usize>(workers);
            let work_rx = Mutex::new(work_rx);
            let (result_tx, result_rx) = mpsc::channel::<(usize, RepoHealth)>();
            let skip_fetch = options.skip_fetch;
            let check_work_tree = options.check_work_tree;
            let recommendations = options.recommendations;
            let fetch_timeout = options.effective_fetch_timeout();

            thread::scope(|scope| {
                scope.spawn(move || {
                    for index in 0..total {
                        if ctx.is_cancelled() || work_tx.send(index).is_err() {
                            break;
                        }
                    }
                });

                for _ in 0..workers {
                    let work_rx = &work_rx;
                    let results = result_tx.clone();
                    scope.spawn(move || {
                        loop {
                            let next = match work_rx.lock() {
                                Ok(guard) => guard.recv(),
                                Err(_) => break,
                            };
                            let Ok(index) = next else {
                                break;
                            };
                            if ctx.is_cancelled() {
                                continue;
                            }
                            let check = RepoCheck {
                                inspector,
                                skip_fetch,
                                check_work_tree,
                                recommendations,
                                fetch_timeout,
                            };
                            let health = check.run(ctx, &repos[index]);
                            if results.send((index, health)).is_err() {
                                break;
                            }
                        }
                    });
                }
                drop(result_tx);

                let mut done = 0;
                for (index, health) in result_rx {
                    done += 1;
                    if let Some(callback) = &options.progress {
                        callback(&health, done, total);
                    }
                    slots[index] = Some(health);
                }
            });
        }

        let results: Vec<RepoHealth> = slots
            .into_iter()
            .zip(repos)
            .map(|(slot, repo)| slot.unwrap_or_else(|| cancelled_health(repo)))
            .collect();
        let summary = HealthSummary::tally(&results);
        info!(
            total = summary.total,
            healthy = summary.healthy,
            warning = summary.warning,
            error = summary.error,
            unreachable = summary.unreachable,
            "fleet health checked"
        );
        Ok(HealthReport {
            results,
            summary,
            duration: started.elapsed(),
            generated_at: now_rfc3339(),
        })
    }
}

fn cancelled_health(repo: &RepoSpec) -> RepoHealth {
    RepoHealth {
        repo: repo.clone(),
        status: HealthStatus::Error,
        error: Some("operation cancelled before the check started".to_string()),
        ..RepoHealth::default()
    }
}

struct RepoCheck<'a> {
    inspector: &'a dyn RepoInspector,
    skip_fetch: bool,
    check_work_tree: bool,
    recommendations: bool,
    fetch_timeout: std::time::Duration,
}

impl RepoCheck<'_> {
    fn run(&self, ctx: &CancelToken, repo: &RepoSpec) -> RepoHealth {
        let started = Instant::now();
        let mut health = RepoHealth {
            repo: repo.clone(),
            ..RepoHealth::default()
        };
        self.check(ctx, repo, &mut health);
        if self.recommendations {
            health.recommendation = recommend(&health);
        }
        health.timings.total = started.elapsed();
        debug!(repo = %repo.name, status = %health.status, "repo checked");
        health
    }

    fn check(&self, ctx: &CancelToken, repo: &RepoSpec, health: &mut RepoHealth) {
        let path = repo.path.as_path();

        let step = Instant::now();
        let opened = self.inspector.open(path);
        health.timings.open = step.elapsed();
        if let Err(err) = opened {
            health.status = HealthStatus::Unreachable;
            health.error = Some(format!("{err:#}"));
            return;
        }

        let step = Instant::now();
        let info = self.inspector.branch_info(path);
        health.timings.branch = step.elapsed();
        let info = match info {
            Ok(info) => info,
            Err(err) => {
                health.status = HealthStatus::Error;
                health.error = Some(format!("{err:#}"));
                return;
            }
        };
        health.branch = info.branch;

        if self.skip_fetch {
            health.network = NetworkStatus::Skipped;
        } else {
            let step = Instant::now();
            let fetch_ctx = ctx.child_with_timeout(self.fetch_timeout);
            let output = self.inspector.fetch_all(&fetch_ctx, path);
            health.timings.fetch = step.elapsed();
            if let Some(err) = &output.error
                && FleetError::is_cancellation(err)
            {
                health.status = HealthStatus::Error;
                health.error = Some("operation cancelled".to_string());
                return;
            }
            health.network = classify_network(output.error.as_ref(), &output.stderr);
            match health.network {
                NetworkStatus::Timeout | NetworkStatus::Unreachable => {
                    warn!(repo = %repo.name, network = ?health.network, "fetch failed");
                    health.status = HealthStatus::Unreachable;
                    health.error = output.error.map(|err| format!("{err:#}"));
                    return;
                }
                NetworkStatus::AuthFailed => {
                    warn!(repo = %repo.name, "fetch refused; using local refs");
                }
                _ => {}
            }
        }

        let info = match self.inspector.branch_info(path) {
            Ok(info) => info,
            Err(err) => {
                health.status = HealthStatus::Error;
                health.error = Some(format!("{err:#}"));
                return;
            }
        };
        health.branch = info.branch;
        health.upstream = info.upstream;
        health.ahead = info.ahead;
        health.behind = info.behind;

        if self.check_work_tree {
            let step = Instant::now();
            match self.inspector.work_tree_counts(path) {
                Ok(counts) => {
                    health.modified = counts.modified;
                    health.staged = counts.staged;
                    health.untracked = counts.untracked;
                    health.conflicts = counts.conflicts;
                    health.work_tree = work_tree_status(counts.conflicts, counts.changed());
                }
                Err(err) => {
                    debug!(repo = %repo.name, error = %format!("{err:#}"), "status check failed; assuming clean");
                    health.work_tree = WorkTreeStatus::Clean;
                }
            }
            health.timings.status = step.elapsed();
        }

        health.divergence = classify_divergence(
            health.upstream.as_deref(),
            health.conflicts,
            health.ahead,
            health.behind,
        );
        health.status = classify_health(
            health.network,
            health.work_tree,
            health.divergence,
            health.behind,
        );
    }
}
