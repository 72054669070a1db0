use std::time::Duration;

use lxkit::buffer::{
    CMDEND, CMDSTART, decode_chunk, extract_frame, frame_command, split_exit_code, strip_control,
    with_exit_code,
};
use lxkit::config::BufferTimeouts;
use lxkit::shell::{BASH, Escalation, MYSQL, PROMPT_TERMINATORS, ShellState};

/// What a PTY typically hands back for one framed command: the echoed
/// command, colored output, carriage returns, and a trailing prompt.
fn raw_pty_output(body: &str) -> String {
    format!(
        "COLUMNS=200; export COLUMNS; echo CMDSTART && cmd && echo CMDEND\r\n\
         CMDSTART\r\n\
         \x1b[01;32m{body}\x1b[0m\r\n\
         CMDEND\r\n\
         [admin@web01 ~]$ "
    )
}

#[test]
fn framed_round_trip_strips_markers_and_csi() {
    let raw = raw_pty_output("test_str");
    let cleaned = strip_control(&raw);
    let body = extract_frame(&cleaned);

    assert_eq!(body, "test_str");
    assert!(!body.contains(CMDSTART));
    assert!(!body.contains(CMDEND));
    assert!(!body.contains('\x1b'));
}

#[test]
fn prompt_terminator_mid_line_does_not_break_framing() {
    // A motd containing '#' sits before the frame; the sentinel window is
    // immune to it.
    let raw = format!(
        "### maintenance window tonight ###\n{}",
        raw_pty_output("uptime: 12 days")
    );
    assert_eq!(extract_frame(&strip_control(&raw)), "uptime: 12 days");
}

#[test]
fn multi_line_bodies_survive_extraction() {
    let raw = raw_pty_output("line one\r\nline two\r\nline three");
    let body = extract_frame(&strip_control(&raw));
    assert_eq!(body.lines().count(), 3);
    assert!(body.ends_with("line three"));
}

#[test]
fn frame_command_is_idempotent() {
    let framed = frame_command("df -h", false);
    assert_eq!(frame_command(&framed, false), framed);
    assert!(framed.starts_with("COLUMNS=200; export COLUMNS; echo CMDSTART"));
    assert!(framed.ends_with("echo CMDEND"));
}

#[test]
fn latin1_fallback_never_loses_bytes() {
    let mixed: Vec<u8> = b"ASCII then \xff\xfe latin".to_vec();
    let decoded = decode_chunk(&mixed);
    assert!(decoded.starts_with("ASCII then "));
    assert_eq!(decoded.chars().count(), mixed.len());
}

#[test]
fn exit_code_helper_reads_trailing_status() {
    let cmd = with_exit_code("systemctl is-active sshd");
    assert!(cmd.ends_with("; echo $?"));

    let (body, success) = split_exit_code("active\n0\n");
    assert!(success);
    assert_eq!(body, "active");

    let (body, success) = split_exit_code("inactive\n3\n");
    assert!(!success);
    assert_eq!(body, "inactive");
}

#[test]
fn default_terminator_set_is_exactly_the_contract() {
    assert_eq!(PROMPT_TERMINATORS, &['$', '>', '#', '@', ']', '~']);
}

#[test]
fn timeout_clamps_follow_the_run_bound() {
    let timeouts = BufferTimeouts::default().with_run(Duration::from_secs(1));
    // first-bit ≤ 80% of run, between-bit ≤ 10% of run
    assert!(timeouts.first_bit <= Duration::from_millis(800));
    assert!(timeouts.between_bit <= Duration::from_millis(100));
    assert!(timeouts.delay >= Duration::from_millis(1));
}

#[test]
fn escalation_stack_tracks_whoami_and_deescalation_symmetry() {
    let mut state = ShellState::new();
    state.push(Escalation::user("admin", "su -", Some("pw".into())));
    assert_eq!(state.current_user(), "admin");

    let depth_before = state.depth();
    state.push(Escalation::user("root", "sudo su -", Some("rootpw".into())));
    assert_eq!(state.current_user(), "root");

    // becomeUser(previous) pops the intervening entry: depth is unchanged
    // modulo the push/pop pair.
    state.pop();
    assert_eq!(state.depth(), depth_before);
    assert_eq!(state.current_user(), "admin");
}

#[test]
fn console_stack_reports_current_console() {
    let mut state = ShellState::new();
    assert_eq!(state.current_console(), BASH);
    state.push(Escalation::console(MYSQL, "mysql -u root", Some("pw".into())));
    assert_eq!(state.current_console(), MYSQL);
    state.pop();
    assert_eq!(state.current_console(), BASH);
}
