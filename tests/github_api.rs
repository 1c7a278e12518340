//! GitHub client tests against an in-process fake of the REST and GraphQL
//! endpoints the client uses.

use assert_cmd::cargo::cargo_bin_cmd;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::Json;
use chrono::Utc;
use fleetpatch::errors::{ApplyError, PlatformError};
use fleetpatch::patch::FileMode;
use fleetpatch::platform::{
    CommitDescriptor, FileAddition, FileChanges, GitHubClient, Identity, Platform, PullRequestDescriptor,
    RepoRef,
};
use predicates::prelude::*;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Recorded {
    method: &'static str,
    path: String,
    query: HashMap<String, String>,
    body: Value,
}

#[derive(Default)]
struct FakeGitHub {
    repos: HashMap<String, Value>,
    pulls: Vec<Value>,
    /// GraphQL blob texts keyed by `revision:path`.
    files: HashMap<String, String>,
    branch_tip: String,
    reject_ref_update: bool,
    repo_lookup_status: Option<u16>,
    requests: Vec<Recorded>,
}

type Shared = Arc<Mutex<FakeGitHub>>;
type Reply = Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>;

fn record(state: &Shared, method: &'static str, path: String, query: HashMap<String, String>, body: Value) {
    state.lock().unwrap().requests.push(Recorded {
        method,
        path,
        query,
        body,
    });
}

fn repo_json(owner: &str, name: &str, parent: Option<(&str, &str)>) -> Value {
    let mut repo = json!({
        "name": name,
        "owner": { "login": owner },
        "default_branch": "main",
        "fork": parent.is_some(),
    });
    if let Some((p_owner, p_name)) = parent {
        repo["parent"] = json!({
            "name": p_name,
            "owner": { "login": p_owner },
            "default_branch": "main",
        });
    }
    repo
}

fn pull_json(number: u64, login: &str) -> Value {
    json!({
        "number": number,
        "html_url": format!("https://github.com/acme/widgets/pull/{}", number),
        "state": "open",
        "user": { "login": login },
    })
}

async fn user(State(state): State<Shared>) -> Json<Value> {
    record(&state, "GET", "/user".into(), HashMap::new(), Value::Null);
    Json(json!({ "login": "octo" }))
}

async fn repo(State(state): State<Shared>, Path((owner, name)): Path<(String, String)>) -> Reply {
    let path = format!("/repos/{}/{}", owner, name);
    record(&state, "GET", path, HashMap::new(), Value::Null);
    let guard = state.lock().unwrap();
    if let Some(status) = guard.repo_lookup_status {
        let code = StatusCode::from_u16(status).unwrap();
        return Err((code, Json(json!({ "message": "Server Error" }))));
    }
    match guard.repos.get(&format!("{}/{}", owner, name)) {
        Some(repo) => Ok((StatusCode::OK, Json(repo.clone()))),
        None => Err((StatusCode::NOT_FOUND, Json(json!({ "message": "Not Found" })))),
    }
}

async fn fork(
    State(state): State<Shared>,
    Path((owner, name)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    record(&state, "POST", format!("/repos/{}/{}/forks", owner, name), HashMap::new(), body);
    (StatusCode::ACCEPTED, Json(repo_json("octo", &name, Some((&owner, &name)))))
}

async fn list_pulls(
    State(state): State<Shared>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let per_page: usize = query.get("per_page").and_then(|v| v.parse().ok()).unwrap_or(30);
    let page: usize = query.get("page").and_then(|v| v.parse().ok()).unwrap_or(1);
    record(&state, "GET", format!("/repos/{}/{}/pulls", owner, name), query, Value::Null);
    let pulls = state.lock().unwrap().pulls.clone();
    let start = (page - 1) * per_page;
    Json(Value::Array(pulls.into_iter().skip(start).take(per_page).collect()))
}

async fn create_pull(
    State(state): State<Shared>,
    Path((owner, name)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    record(&state, "POST", format!("/repos/{}/{}/pulls", owner, name), HashMap::new(), body);
    (StatusCode::CREATED, Json(pull_json(7, "octo")))
}

async fn git_commit(
    State(state): State<Shared>,
    Path((owner, name, sha)): Path<(String, String, String)>,
) -> Json<Value> {
    record(
        &state,
        "GET",
        format!("/repos/{}/{}/git/commits/{}", owner, name, sha),
        HashMap::new(),
        Value::Null,
    );
    Json(json!({ "sha": sha, "tree": { "sha": "tree-base" } }))
}

async fn git_tree(
    State(state): State<Shared>,
    Path((owner, name)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    record(&state, "POST", format!("/repos/{}/{}/git/trees", owner, name), HashMap::new(), body);
    (StatusCode::CREATED, Json(json!({ "sha": "tree-new" })))
}

async fn create_git_commit(
    State(state): State<Shared>,
    Path((owner, name)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    record(&state, "POST", format!("/repos/{}/{}/git/commits", owner, name), HashMap::new(), body);
    (StatusCode::CREATED, Json(json!({ "sha": "commit-new" })))
}

async fn update_ref(
    State(state): State<Shared>,
    Path((owner, name, branch)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Reply {
    let path = format!("/repos/{}/{}/git/refs/heads/{}", owner, name, branch);
    record(&state, "PATCH", path, HashMap::new(), body.clone());
    if state.lock().unwrap().reject_ref_update {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "message": "Update is not a fast forward" })),
        ));
    }
    Ok((
        StatusCode::OK,
        Json(json!({ "ref": format!("refs/heads/{}", branch), "object": { "sha": body["sha"] } })),
    ))
}

async fn graphql(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    record(&state, "POST", "/graphql".into(), HashMap::new(), body.clone());
    let guard = state.lock().unwrap();
    let vars = &body["variables"];
    if vars.get("qualifiedName").is_some() {
        return Json(json!({
            "data": { "repository": { "ref": { "target": { "oid": guard.branch_tip } } } }
        }));
    }
    let expression = vars["expression"].as_str().unwrap_or_default();
    let object = match guard.files.get(expression) {
        Some(text) => json!({ "text": text, "isBinary": false }),
        None => Value::Null,
    };
    Json(json!({ "data": { "repository": { "object": object } } }))
}

/// Serve the fake on an ephemeral port and return its base URL.
async fn spawn_fake(state: Shared) -> String {
    let app = Router::new()
        .route("/user", get(user))
        .route("/repos/{owner}/{name}", get(repo))
        .route("/repos/{owner}/{name}/forks", post(fork))
        .route("/repos/{owner}/{name}/pulls", get(list_pulls).post(create_pull))
        .route("/repos/{owner}/{name}/git/commits", post(create_git_commit))
        .route("/repos/{owner}/{name}/git/commits/{sha}", get(git_commit))
        .route("/repos/{owner}/{name}/git/trees", post(git_tree))
        .route("/repos/{owner}/{name}/git/refs/heads/{*branch}", patch(update_ref))
        .route("/graphql", post(graphql))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn fleetpatch() -> assert_cmd::Command {
    cargo_bin_cmd!("fleetpatch")
}

fn fake_state() -> Shared {
    let mut fake = FakeGitHub {
        branch_tip: "base-sha".to_string(),
        ..FakeGitHub::default()
    };
    fake.repos
        .insert("acme/widgets".to_string(), repo_json("acme", "widgets", None));
    Arc::new(Mutex::new(fake))
}

async fn client(state: &Shared) -> GitHubClient {
    let base = spawn_fake(Arc::clone(state)).await;
    GitHubClient::new(&base, &format!("{}/graphql", base), "ghp_test").unwrap()
}

fn requests(state: &Shared) -> Vec<Recorded> {
    state.lock().unwrap().requests.clone()
}

fn descriptor() -> CommitDescriptor {
    let bot = Identity {
        name: "bot".to_string(),
        email: "bot@example.com".to_string(),
    };
    CommitDescriptor {
        author: bot.clone(),
        committer: bot,
        author_date: Utc::now(),
        committer_date: Utc::now(),
        title: "ci: migrate".to_string(),
        body: "details".to_string(),
        base_revision: "base-sha".to_string(),
    }
}

fn fork_ref() -> RepoRef {
    RepoRef {
        owner: "octo".to_string(),
        name: "widgets".to_string(),
        default_branch: "main".to_string(),
    }
}

mod client_requests {
    use super::*;

    #[tokio::test]
    async fn test_current_actor_from_user_endpoint() {
        let state = fake_state();
        let gh = client(&state).await;
        assert_eq!(gh.current_actor().await.unwrap(), "octo");
        assert_eq!(requests(&state)[0].path, "/user");
    }

    #[tokio::test]
    async fn test_configured_actor_skips_lookup() {
        let state = fake_state();
        let gh = client(&state).await.with_actor(Some("someone".to_string()));
        assert_eq!(gh.current_actor().await.unwrap(), "someone");
        assert!(requests(&state).is_empty());
    }

    #[tokio::test]
    async fn test_get_repository_found_and_missing() {
        let state = fake_state();
        let gh = client(&state).await;

        let repo = gh.get_repository("acme", "widgets").await.unwrap().unwrap();
        assert_eq!(repo.full_name(), "acme/widgets");
        assert_eq!(repo.default_branch, "main");
        assert!(repo.parent.is_none());

        assert!(gh.get_repository("octo", "widgets").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let state = fake_state();
        state.lock().unwrap().repo_lookup_status = Some(502);
        let gh = client(&state).await;

        let err = gh.get_repository("acme", "widgets").await.unwrap_err();
        assert!(matches!(err, PlatformError::Status { status: 502, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_create_fork_default_branch_only() {
        let state = fake_state();
        let gh = client(&state).await;

        let fork = gh.create_fork("acme", "widgets").await.unwrap();
        assert_eq!(fork.full_name(), "octo/widgets");
        assert_eq!(fork.parent.unwrap().owner, "acme");

        let req = &requests(&state)[0];
        assert_eq!(req.path, "/repos/acme/widgets/forks");
        assert_eq!(req.body["default_branch_only"], true);
    }

    #[tokio::test]
    async fn test_list_pull_requests_filters_author() {
        let state = fake_state();
        state.lock().unwrap().pulls = vec![pull_json(1, "someone"), pull_json(2, "Octo")];
        let gh = client(&state).await;

        let pulls = gh.list_pull_requests("acme", "widgets", "octo").await.unwrap();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].number, 2);

        let req = &requests(&state)[0];
        assert_eq!(req.query.get("state").map(String::as_str), Some("open"));
    }

    #[tokio::test]
    async fn test_list_pull_requests_follows_pages() {
        let state = fake_state();
        {
            let mut fake = state.lock().unwrap();
            fake.pulls = (1..=100).map(|n| pull_json(n, "someone")).collect();
            fake.pulls.push(pull_json(101, "octo"));
        }
        let gh = client(&state).await;

        let pulls = gh.list_pull_requests("acme", "widgets", "octo").await.unwrap();
        assert_eq!(pulls.len(), 1);
        assert_eq!(pulls[0].number, 101);

        let pages: Vec<String> = requests(&state)
            .iter()
            .filter_map(|r| r.query.get("page").cloned())
            .collect();
        assert_eq!(pages, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn test_create_pull_request_sends_head_and_base() {
        let state = fake_state();
        let gh = client(&state).await;
        let descriptor = PullRequestDescriptor {
            title: "ci: migrate".to_string(),
            body: "details".to_string(),
            base: "main".to_string(),
            head: "octo:main".to_string(),
            head_repo: "octo/widgets".to_string(),
            draft: false,
            maintainer_can_modify: true,
        };

        let pr = gh.create_pull_request("acme", "widgets", &descriptor).await.unwrap();
        assert_eq!(pr.number, 7);
        assert_eq!(pr.author, "octo");

        let req = &requests(&state)[0];
        assert_eq!(req.method, "POST");
        assert_eq!(req.body["head"], "octo:main");
        assert_eq!(req.body["base"], "main");
    }

    #[tokio::test]
    async fn test_branch_tip_and_file_content() {
        let state = fake_state();
        state
            .lock()
            .unwrap()
            .files
            .insert("main:ci.yml".to_string(), "on: push\n".to_string());
        let gh = client(&state).await;

        assert_eq!(gh.branch_tip("octo", "widgets", "main").await.unwrap(), "base-sha");
        assert_eq!(
            gh.file_content("acme", "widgets", "main", "ci.yml").await.unwrap().as_deref(),
            Some("on: push\n")
        );
        assert!(gh.file_content("acme", "widgets", "main", "gone.yml").await.unwrap().is_none());

        let reqs = requests(&state);
        assert_eq!(reqs[0].body["variables"]["qualifiedName"], "refs/heads/main");
        assert_eq!(reqs[1].body["variables"]["expression"], "main:ci.yml");
    }
}

mod commits {
    use super::*;

    fn changes() -> FileChanges {
        FileChanges {
            additions: vec![FileAddition {
                path: ".github/workflows/ci.yml".to_string(),
                contents: "echo \"a=b\" >> \"$GITHUB_OUTPUT\"\n".to_string(),
                mode: FileMode::Regular,
            }],
            deletions: vec!["old.yml".to_string()],
        }
    }

    #[tokio::test]
    async fn test_create_commit_builds_tree_commit_and_ref() {
        let state = fake_state();
        let gh = client(&state).await;

        let sha = gh
            .create_commit(&fork_ref(), "main", &changes(), &descriptor())
            .await
            .unwrap();
        assert_eq!(sha, "commit-new");

        let reqs = requests(&state);
        let paths: Vec<&str> = reqs.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/repos/octo/widgets/git/commits/base-sha",
                "/repos/octo/widgets/git/trees",
                "/repos/octo/widgets/git/commits",
                "/repos/octo/widgets/git/refs/heads/main",
            ]
        );

        let tree = &reqs[1].body;
        assert_eq!(tree["base_tree"], "tree-base");
        let entries = tree["tree"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["path"], "old.yml");
        assert!(entries[0]["sha"].is_null());
        assert_eq!(entries[1]["mode"], "100644");
        assert!(entries[1]["content"].as_str().unwrap().contains("GITHUB_OUTPUT"));

        let commit = &reqs[2].body;
        assert_eq!(commit["parents"], json!(["base-sha"]));
        assert_eq!(commit["message"], "ci: migrate\n\ndetails");
        assert_eq!(commit["author"]["email"], "bot@example.com");

        let update = &reqs[3].body;
        assert_eq!(update["sha"], "commit-new");
        assert_eq!(update["force"], false);
    }

    #[tokio::test]
    async fn test_rejected_ref_update_is_stale_base() {
        let state = fake_state();
        state.lock().unwrap().reject_ref_update = true;
        let gh = client(&state).await;

        let err = gh
            .create_commit(&fork_ref(), "main", &changes(), &descriptor())
            .await
            .unwrap_err();
        match err {
            ApplyError::StaleBase(msg) => assert!(msg.contains("not a fast forward")),
            other => panic!("expected StaleBase, got {:?}", other),
        }
    }
}

// =============================================================================
// CLI dry run against the fake
// =============================================================================

mod cli_dry_run {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dry_run_reports_patch_without_mutations() {
        let state = fake_state();
        state.lock().unwrap().files.insert(
            "main:.github/workflows/ci.yml".to_string(),
            "steps:\n  - run: echo \"::set-output name=ver::1.0\"\n".to_string(),
        );
        let base = spawn_fake(Arc::clone(&state)).await;

        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".fleetpatch")).unwrap();
        fs::write(
            dir.path().join(".fleetpatch/fleetpatch.toml"),
            format!(
                "[github]\napi_url = \"{base}\"\ngraphql_url = \"{base}/graphql\"\nactor = \"octo\"\ntoken_env = \"FLEETPATCH_TEST_TOKEN\"\n"
            ),
        )
        .unwrap();
        fs::write(dir.path().join("repos.txt"), "acme/widgets/.github/workflows/ci.yml\n").unwrap();

        let project = dir.path().to_path_buf();
        let assert = tokio::task::spawn_blocking(move || {
            fleetpatch()
                .current_dir(&project)
                .env("FLEETPATCH_TEST_TOKEN", "ghp_test")
                .args(["run", "--dry-run"])
                .assert()
        })
        .await
        .unwrap();

        assert
            .success()
            .stdout(predicate::str::contains("acme/widgets"))
            .stdout(predicate::str::contains("would change"))
            .stdout(predicate::str::contains(".github/workflows/ci.yml"));

        let reqs = requests(&state);
        assert!(reqs.iter().all(|r| r.method == "GET" || r.path == "/graphql"));
        assert!(reqs.iter().any(|r| r.path == "/repos/octo/widgets"));

        // The workspace is restored to its baseline after the diff.
        let ci = fs::read_to_string(dir.path().join("workspaces/acme/widgets/.github/workflows/ci.yml")).unwrap();
        assert!(ci.contains("::set-output"));
    }
}
