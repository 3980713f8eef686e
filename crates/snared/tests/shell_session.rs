//! Command prompt behaviour as seen by a connected attacker.

use snare_common::config::ShellConfig;
use snared::shell::{CommandOutcome, HostProfile, ShellSession};

fn session(identity: &str) -> ShellSession {
    let config = ShellConfig::default();
    ShellSession::new(
        identity,
        HostProfile {
            hostname: config.hostname.clone(),
            domain: config.domain.clone(),
            identities: vec![
                "Administrator".to_string(),
                "Guest".to_string(),
                "John".to_string(),
            ],
        },
    )
}

fn run(session: &mut ShellSession, line: &str) -> String {
    match session.execute(line) {
        CommandOutcome::Output(text) => text,
        CommandOutcome::Exit => panic!("{:?} ended the session", line),
    }
}

#[test]
fn test_whoami_reports_domain_identity() {
    let mut s = session("Administrator");
    assert_eq!(run(&mut s, "whoami"), r"domain\Administrator");
    assert_eq!(run(&mut s, "  WHOAMI  "), r"domain\Administrator");
}

#[test]
fn test_net_user_unknown_name() {
    let mut s = session("Administrator");
    let reply = run(&mut s, "net user carol");
    assert!(reply.contains("The user name could not be found: carol"));

    let known = run(&mut s, "NET USER john");
    assert!(known.starts_with("User name                    John"));
}

#[test]
fn test_type_secret_is_denied() {
    let mut s = session("Administrator");
    assert_eq!(run(&mut s, "type secret.txt"), "Access is denied.");
    assert_eq!(run(&mut s, r"type Secrets\secret.txt"), "Access is denied.");
}

#[test]
fn test_empty_input_is_silent() {
    let mut s = session("Guest");
    let before = s.working_dir().to_string();
    assert_eq!(run(&mut s, ""), "");
    assert_eq!(run(&mut s, "   "), "");
    assert_eq!(s.working_dir(), before);
}

#[test]
fn test_exit_and_logout_end_session() {
    let mut s = session("Guest");
    assert_eq!(s.execute("exit"), CommandOutcome::Exit);
    assert_eq!(s.execute("LOGOUT"), CommandOutcome::Exit);
    assert!(s.execute("exit").text().is_none());
}

#[test]
fn test_cd_round_trip_restores_home() {
    let mut s = session("Administrator");
    let home = s.working_dir().to_string();
    assert_eq!(home, r"C:\Users\Administrator");

    assert_eq!(run(&mut s, "cd Documents"), "");
    assert_eq!(s.working_dir(), r"C:\Users\Administrator\Documents");
    assert_eq!(run(&mut s, "cd .."), "");
    assert_eq!(s.working_dir(), home);
}

#[test]
fn test_cd_up_at_home_is_floor() {
    let mut s = session("John");
    let home = s.working_dir().to_string();
    assert_eq!(run(&mut s, "cd .."), "");
    assert_eq!(run(&mut s, "cd .."), "");
    assert_eq!(s.working_dir(), home);
}

#[test]
fn test_cd_unknown_leaves_state() {
    let mut s = session("John");
    run(&mut s, "cd Desktop");
    assert_eq!(
        run(&mut s, "cd Vault"),
        "The system cannot find the path specified: Vault"
    );
    assert_eq!(s.working_dir(), r"C:\Users\John\Desktop");
}

#[test]
fn test_prompt_follows_working_directory() {
    let mut s = session("Administrator");
    run(&mut s, "cd secrets");
    assert_eq!(s.prompt(), r"C:\Users\Administrator\Secrets> ");
    let listing = run(&mut s, "dir");
    assert!(listing.contains("secret.txt"));
    assert!(listing.contains(r"Directory of C:\Users\Administrator\Secrets"));
}

#[test]
fn test_sessions_do_not_share_state() {
    let mut a = session("Administrator");
    let b = session("Administrator");
    run(&mut a, "cd Downloads");
    assert_eq!(b.working_dir(), r"C:\Users\Administrator");
}

#[test]
fn test_unknown_command_in_character() {
    let mut s = session("Guest");
    assert_eq!(
        run(&mut s, "ls -la"),
        "'ls -la' is not recognized as an internal or external command, operable program or batch file."
    );
}
