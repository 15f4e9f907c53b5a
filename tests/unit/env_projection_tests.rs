//! Environment allow-list projection and command construction.

use callwarden::config::GlobalConfig;
use callwarden::process::spawner::{project_env, ALLOWED_ENV_VARS};
use callwarden::process::ProcessRunner;

fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

fn runner(extra: &str) -> ProcessRunner {
    let raw = format!("db_path = \"ledger.db\"\n\n[process]\ncommand = \"agent\"\n{extra}");
    let config = GlobalConfig::from_toml_str(&raw).expect("config parses");
    ProcessRunner::new(config.process)
}

#[test]
fn unlisted_variables_are_stripped() {
    let projected = project_env(
        &[],
        vars(&[
            ("PATH", "/usr/bin"),
            ("AWS_SECRET_ACCESS_KEY", "hunter2"),
            ("HOME", "/home/agent"),
            ("GITHUB_TOKEN", "ghp_x"),
        ]),
    );

    assert_eq!(
        projected,
        vars(&[("PATH", "/usr/bin"), ("HOME", "/home/agent")])
    );
}

#[test]
fn extra_allowlist_names_pass_through() {
    let projected = project_env(
        &["AGENT_API_KEY".to_owned()],
        vars(&[("AGENT_API_KEY", "k"), ("OTHER_KEY", "x")]),
    );
    assert_eq!(projected, vars(&[("AGENT_API_KEY", "k")]));
}

#[test]
fn names_match_exactly() {
    let projected = project_env(&[], vars(&[("PATH_EXTRA", "x"), ("path", "y")]));
    assert!(projected.is_empty());
}

#[test]
fn default_allowlist_covers_basics() {
    for name in ["PATH", "HOME", "LANG", "TMPDIR"] {
        assert!(ALLOWED_ENV_VARS.contains(&name), "{name} missing");
    }
}

#[test]
fn fresh_call_uses_configured_args_only() {
    let runner = runner("args = [\"--print\"]\n");
    let spec = runner.command_spec(None);

    assert_eq!(spec.program, "agent");
    assert_eq!(spec.args, vec!["--print"]);
}

#[test]
fn resumed_call_appends_resume_args_with_token() {
    let runner = runner("args = [\"--print\"]\n");
    let spec = runner.command_spec(Some("sess-42"));

    assert_eq!(spec.args, vec!["--print", "--resume", "sess-42"]);
}

#[test]
fn custom_resume_template_is_substituted() {
    let runner = runner("resume_args = [\"--session={token}\"]\nenv_allowlist = [\"AGENT_API_KEY\"]\n");
    let spec = runner.command_spec(Some("abc"));

    assert_eq!(spec.args, vec!["--session=abc"]);
    assert_eq!(spec.env_allowlist, vec!["AGENT_API_KEY"]);
}

#[test]
fn prompt_never_appears_in_args() {
    let runner = runner("");
    let spec = runner.command_spec(Some("tok"));
    assert!(spec.args.iter().all(|arg| !arg.contains("prompt")));
    assert_eq!(spec.args, vec!["--resume", "tok"]);
}
