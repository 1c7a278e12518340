//! End-to-end pipeline behavior against the in-memory platform.
//!
//! Every test runs real git workspaces in a temp directory and a virtual
//! clock, so pacing never sleeps.

use fleetpatch::config::RewriteSection;
use fleetpatch::dispatch::{Dispatcher, InMemoryRegistry};
use fleetpatch::errors::{ApplyError, Stage, StageErrorKind};
use fleetpatch::pacing::{ManualClock, Pacer, RetryPolicy};
use fleetpatch::pipeline::{Outcome, Pipeline, RepositoryState};
use fleetpatch::platform::{FakePlatform, Identity, Platform, PlatformCall};
use fleetpatch::report::RunReport;
use fleetpatch::rewrite::{RegexRewriter, RewriteOutcome, Rewriter};
use fleetpatch::task::{parse_line, parse_task_list};
use fleetpatch::workspace::WorkspaceManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const CI: &str = ".github/workflows/ci.yml";
const DEPRECATED: &str = "jobs:\n  build:\n    steps:\n      - run: echo \"::set-output name=ver::1.0\"\n";
const CLEAN: &str = "jobs:\n  build:\n    steps:\n      - run: echo hi\n";
const NO_FINAL_NEWLINE: &str = "steps:\n  - run: echo \"::set-output name=v::1\"";

struct Harness {
    fake: Arc<FakePlatform>,
    clock: Arc<ManualClock>,
    root: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            fake: Arc::new(FakePlatform::new("octo")),
            clock: Arc::new(ManualClock::new()),
            root: TempDir::new().unwrap(),
        }
    }

    fn workspace_root(&self) -> PathBuf {
        self.root.path().join("workspaces")
    }

    fn pipeline_with(&self, rewriter: Arc<dyn Rewriter>) -> Pipeline {
        let workspaces = WorkspaceManager::new(
            self.workspace_root(),
            ".github/workflows",
            "changes.patch",
            Identity {
                name: "bot".to_string(),
                email: "bot@example.com".to_string(),
            },
        );
        let pacer = Pacer::new(
            self.clock.clone(),
            Duration::from_secs(2),
            Duration::from_secs(3),
            Duration::ZERO,
        );
        let platform: Arc<dyn Platform> = self.fake.clone();
        Pipeline::new(platform, workspaces, rewriter, "octo").with_pacer(Arc::new(pacer))
    }

    fn pipeline(&self) -> Pipeline {
        let rewriter = RegexRewriter::from_config(&RewriteSection::default()).unwrap();
        self.pipeline_with(Arc::new(rewriter))
    }

    async fn run(&self, pipeline: Pipeline, input: &str) -> RunReport {
        Dispatcher::new(Arc::new(pipeline), Arc::new(InMemoryRegistry::new()))
            .with_max_parallel(Some(2))
            .run(parse_task_list(input))
            .await
    }

    fn mutations(&self) -> usize {
        self.fake.count_calls(PlatformCall::is_mutation)
    }
}

/// Adds a binary file next to the real rewrite.
struct BinaryDroppingRewriter(RegexRewriter);

impl Rewriter for BinaryDroppingRewriter {
    fn rewrite(&self, workspace: &Path, target: Option<&Path>) -> anyhow::Result<RewriteOutcome> {
        let outcome = self.0.rewrite(workspace, target)?;
        std::fs::write(workspace.join("logo.png"), [0x89, b'P', b'N', b'G', 0, 0, 1, 2])?;
        Ok(outcome)
    }
}

mod end_to_end {
    use super::*;

    #[tokio::test]
    async fn test_publishes_then_rerun_is_noop() {
        let h = Harness::new();
        h.fake.add_repository("acme", "widgets", "main", &[(CI, DEPRECATED)]);

        let report = h.run(h.pipeline(), "acme/widgets/.github/workflows/ci.yml\n").await;
        let result = report.result_for("acme/widgets").unwrap();
        assert_eq!(result.state, RepositoryState::Published);
        let Outcome::Published { pr_url, commit, .. } = &result.outcome else {
            panic!("expected Published, got {:?}", result.outcome);
        };
        assert!(pr_url.contains("acme/widgets/pull/"));

        let rewritten = h.fake.file_at("octo", "widgets", "main", CI).unwrap();
        assert!(rewritten.contains(">> \"$GITHUB_OUTPUT\""));
        assert!(!rewritten.contains("::set-output"));
        let created = h.fake.commit("octo", "widgets", commit).unwrap();
        assert_eq!(created.author, "fleetpatch");
        assert_eq!(h.fake.pull_requests("acme", "widgets").len(), 1);

        // Settles after the fork and after the commit.
        assert_eq!(
            h.clock.sleeps(),
            vec![Duration::from_secs(2), Duration::from_secs(3)]
        );

        let before = h.mutations();
        let rerun = h.run(h.pipeline(), "acme/widgets/.github/workflows/ci.yml\n").await;
        assert!(matches!(
            rerun.result_for("acme/widgets").unwrap().outcome,
            Outcome::AlreadyPublished { .. }
        ));
        assert_eq!(h.mutations(), before);
        assert_eq!(h.fake.pull_requests("acme", "widgets").len(), 1);
    }

    #[tokio::test]
    async fn test_target_without_final_newline_publishes() {
        let h = Harness::new();
        h.fake.add_repository("acme", "widgets", "main", &[(CI, NO_FINAL_NEWLINE)]);

        let report = h.run(h.pipeline(), "acme/widgets/.github/workflows/ci.yml\n").await;
        let result = report.result_for("acme/widgets").unwrap();
        assert_eq!(result.state, RepositoryState::Published, "{:?}", result.outcome);
        assert_eq!(
            h.fake.file_at("octo", "widgets", "main", CI).as_deref(),
            Some("steps:\n  - run: echo \"v=1\" >> \"$GITHUB_OUTPUT\"")
        );
    }

    #[tokio::test]
    async fn test_workspace_restored_and_patch_removed() {
        let h = Harness::new();
        h.fake.add_repository("acme", "widgets", "main", &[(CI, DEPRECATED)]);

        h.run(h.pipeline(), "acme/widgets/.github/workflows/ci.yml\n").await;

        let ws = h.workspace_root().join("acme/widgets");
        assert_eq!(std::fs::read_to_string(ws.join(CI)).unwrap(), DEPRECATED);
        assert!(!ws.join("changes.patch").exists());
    }

    #[tokio::test]
    async fn test_dry_run_never_mutates() {
        let h = Harness::new();
        h.fake.add_repository("acme", "widgets", "main", &[(CI, DEPRECATED)]);

        let report = h
            .run(h.pipeline().with_dry_run(true), "acme/widgets/.github/workflows/ci.yml\n")
            .await;
        match &report.result_for("acme/widgets").unwrap().outcome {
            Outcome::DryRun { files } => {
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].path, CI);
                assert_eq!(files[0].lines_added, 1);
                assert_eq!(files[0].lines_removed, 1);
            }
            other => panic!("expected DryRun, got {:?}", other),
        }
        assert!(report.dry_run);
        assert_eq!(h.mutations(), 0);
        assert!(!h.fake.repository_exists("octo", "widgets"));
    }
}

mod dedup {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_key_runs_first_path_only() {
        let h = Harness::new();
        h.fake.add_repository(
            "acme",
            "widgets",
            "main",
            &[(CI, DEPRECATED), (".github/workflows/release.yml", DEPRECATED)],
        );
        let input = "acme/widgets/.github/workflows/ci.yml\n\
                     acme/widgets/.github/workflows/release.yml\n\
                     acme/widgets/.github/workflows/ci.yml\n";

        let report = h.run(h.pipeline(), input).await;

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].target, CI);
        assert_eq!(report.discarded.len(), 2);
        assert!(report.discarded.iter().all(|d| d.first_line == 1));
        assert_eq!(
            h.fake.count_calls(|c| matches!(c, PlatformCall::CreateFork { .. })),
            1
        );
        let fetched: Vec<_> = h
            .fake
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                PlatformCall::FileContent { repo, path, .. } if repo == "acme/widgets" => Some(path),
                _ => None,
            })
            .collect();
        assert_eq!(fetched, vec![CI.to_string()]);
    }
}

mod resume {
    use super::*;

    #[tokio::test]
    async fn test_second_run_reuses_fork_and_workspace() {
        let h = Harness::new();
        h.fake.add_repository("acme", "widgets", "main", &[(CI, DEPRECATED)]);
        h.fake
            .fail_commit("octo", "widgets", ApplyError::Other("connection reset".to_string()));
        let task = parse_line("acme/widgets/.github/workflows/ci.yml", 1).unwrap();

        let first = h.pipeline().run(&task).await;
        assert!(first.fork_created);
        assert!(first.workspace_initialized);
        assert_eq!(first.state, RepositoryState::Failed(Stage::Apply));

        let second = h.pipeline().run(&task).await;
        assert!(!second.fork_created);
        assert!(!second.workspace_initialized);
        assert_eq!(
            h.fake.count_calls(|c| matches!(c, PlatformCall::CreateFork { .. })),
            1
        );
    }
}

mod publish_retry {
    use super::*;

    #[tokio::test]
    async fn test_rerun_after_publish_failure_opens_pull_request() {
        let h = Harness::new();
        h.fake.add_repository("acme", "widgets", "main", &[(CI, DEPRECATED)]);
        h.fake.fail_pull_request("acme", "widgets");
        let input = "acme/widgets/.github/workflows/ci.yml\n";

        let first = h.run(h.pipeline(), input).await;
        assert_eq!(
            first.result_for("acme/widgets").unwrap().state,
            RepositoryState::Failed(Stage::Publish)
        );
        let migrated = h.fake.branch_head("octo", "widgets", "main").unwrap();

        h.fake.clear_failures();
        let second = h.run(h.pipeline(), input).await;
        let result = second.result_for("acme/widgets").unwrap();
        let Outcome::Published { commit, .. } = &result.outcome else {
            panic!("expected Published, got {:?}", result.outcome);
        };
        assert_eq!(commit, &migrated);
        assert_eq!(h.fake.count_calls(|c| matches!(c, PlatformCall::CreateCommit { .. })), 1);
        assert_eq!(h.fake.branch_head("octo", "widgets", "main"), Some(migrated));
        assert_eq!(h.fake.pull_requests("acme", "widgets").len(), 1);
    }
}

mod guards {
    use super::*;

    #[tokio::test]
    async fn test_nothing_to_do_produces_no_commit_or_pr() {
        let h = Harness::new();
        h.fake.add_repository("acme", "widgets", "main", &[(CI, CLEAN)]);

        let report = h.run(h.pipeline(), "acme/widgets/.github/workflows/ci.yml\n").await;
        let result = report.result_for("acme/widgets").unwrap();
        assert!(matches!(result.outcome, Outcome::NothingToDo));
        assert!(!result.outcome.is_failure());
        assert_eq!(report.counts.nothing_to_do, 1);

        assert_eq!(
            h.fake.count_calls(|c| matches!(
                c,
                PlatformCall::CreateCommit { .. } | PlatformCall::CreatePullRequest { .. }
            )),
            0
        );
        let ws = h.workspace_root().join("acme/widgets");
        assert!(!ws.join("changes.patch").exists());
    }

    #[tokio::test]
    async fn test_missing_target_file_fails_workspace_stage() {
        let h = Harness::new();
        h.fake.add_repository("acme", "widgets", "main", &[(CI, DEPRECATED)]);

        let report = h.run(h.pipeline(), "acme/widgets/.github/workflows/missing.yml\n").await;
        let Outcome::Failed(err) = &report.result_for("acme/widgets").unwrap().outcome else {
            panic!("expected failure");
        };
        assert_eq!(err.stage, Stage::Workspace);
        assert_eq!(h.fake.count_calls(|c| matches!(c, PlatformCall::CreateCommit { .. })), 0);
    }

    #[tokio::test]
    async fn test_upstream_read_failure_fails_workspace_stage() {
        let h = Harness::new();
        h.fake.add_repository("acme", "widgets", "main", &[(CI, DEPRECATED)]);
        h.fake.fail_file_content("acme", "widgets");

        let report = h.run(h.pipeline(), "acme/widgets/.github/workflows/ci.yml\n").await;
        let Outcome::Failed(err) = &report.result_for("acme/widgets").unwrap().outcome else {
            panic!("expected failure");
        };
        assert_eq!(err.stage, Stage::Workspace);
        assert!(err.cause.contains("502"));
    }

    #[tokio::test]
    async fn test_unknown_upstream_fails_preflight() {
        let h = Harness::new();
        let report = h.run(h.pipeline(), "acme/ghost/ci.yml\n").await;
        let Outcome::Failed(err) = &report.result_for("acme/ghost").unwrap().outcome else {
            panic!("expected failure");
        };
        assert_eq!(err.stage, Stage::Preflight);
        assert_eq!(h.mutations(), 0);
    }
}

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_apply_failure_is_isolated() {
        let h = Harness::new();
        h.fake.add_repository("acme", "widgets", "main", &[(CI, DEPRECATED)]);
        h.fake.add_repository("acme", "gadgets", "main", &[(CI, DEPRECATED)]);
        h.fake
            .fail_commit("octo", "gadgets", ApplyError::Other("connection reset".to_string()));

        let input = "acme/gadgets/.github/workflows/ci.yml\nacme/widgets/.github/workflows/ci.yml\n";
        let report = h.run(h.pipeline(), input).await;

        assert_eq!(
            report.result_for("acme/widgets").unwrap().state,
            RepositoryState::Published
        );
        let gadgets = report.result_for("acme/gadgets").unwrap();
        assert_eq!(gadgets.state, RepositoryState::Failed(Stage::Apply));
        let err = report.errors().next().unwrap();
        assert_eq!(err.kind, StageErrorKind::Other);
        assert_eq!(err.tag(), "apply-other");
        assert!(h.fake.pull_requests("acme", "gadgets").is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_hunk_distinct_from_network_failure() {
        let h = Harness::new();
        h.fake.add_repository("acme", "widgets", "main", &[(CI, DEPRECATED)]);
        let inner = RegexRewriter::from_config(&RewriteSection::default()).unwrap();
        let pipeline = h.pipeline_with(Arc::new(BinaryDroppingRewriter(inner)));

        let report = h.run(pipeline, "acme/widgets/.github/workflows/ci.yml\n").await;
        let Outcome::Failed(err) = &report.result_for("acme/widgets").unwrap().outcome else {
            panic!("expected failure");
        };
        assert_eq!(err.stage, Stage::Apply);
        assert_eq!(err.kind, StageErrorKind::Unsupported);
        assert_eq!(err.tag(), "apply-unsupported");
        assert_eq!(h.fake.count_calls(|c| matches!(c, PlatformCall::CreateCommit { .. })), 0);
    }

    #[tokio::test]
    async fn test_transient_commit_failure_retried() {
        let h = Harness::new();
        h.fake.add_repository("acme", "widgets", "main", &[(CI, DEPRECATED)]);
        h.fake.fail_commit_transiently("octo", "widgets", 2);
        let retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
        };

        let report = h
            .run(h.pipeline().with_retry(retry), "acme/widgets/.github/workflows/ci.yml\n")
            .await;
        assert_eq!(
            report.result_for("acme/widgets").unwrap().state,
            RepositoryState::Published
        );
        assert_eq!(h.fake.count_calls(|c| matches!(c, PlatformCall::CreateCommit { .. })), 3);
        assert!(h.clock.sleeps().contains(&Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_publish_failure_tagged_publish() {
        let h = Harness::new();
        h.fake.add_repository("acme", "widgets", "main", &[(CI, DEPRECATED)]);
        h.fake.fail_pull_request("acme", "widgets");

        let report = h.run(h.pipeline(), "acme/widgets/.github/workflows/ci.yml\n").await;
        let result = report.result_for("acme/widgets").unwrap();
        assert_eq!(result.state, RepositoryState::Failed(Stage::Publish));
        assert_eq!(report.errors().next().unwrap().tag(), "publish");
    }

    #[tokio::test]
    async fn test_malformed_line_fails_alone() {
        let h = Harness::new();
        h.fake.add_repository("acme", "widgets", "main", &[(CI, DEPRECATED)]);

        let report = h
            .run(h.pipeline(), "widgets\nacme/widgets/.github/workflows/ci.yml\n")
            .await;

        assert_eq!(report.counts.failed, 1);
        assert_eq!(report.counts.published, 1);
        let err = report.errors().next().unwrap();
        assert_eq!(err.stage, Stage::Parse);
        assert_eq!(err.kind, StageErrorKind::Malformed);
        assert_eq!(report.results[0].line, 1);
    }
}
