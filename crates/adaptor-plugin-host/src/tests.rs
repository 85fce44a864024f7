//! Tests for the plugin host.

use std::io::Cursor;

use adaptor_config::Capability;
use adaptor_plugin_sample::{SAMPLE_URI, adaptor_plugin_entry};
use adaptor_plugins::{
    ContextId, Credentials, LibraryBackend, Operation, ReadOutcome, StatusCode, WireMessage,
    read_frame, write_frame,
};
use camino::Utf8Path;
use clap::error::ErrorKind;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;

fn args(capability: &str, package: &str) -> HostArgs {
    parse_args([
        "adaptor-plugin-host",
        "--capability",
        capability,
        "--package",
        package,
        "/plugins/libadaptor_plugin_sample.so",
    ])
    .expect("valid arguments")
}

#[fixture]
fn sample() -> LibraryBackend {
    // SAFETY: the entry point comes from the sample crate's `export_plugin!`.
    unsafe { LibraryBackend::from_entry(adaptor_plugin_entry) }.expect("sample vtable")
}

fn request(operation: Operation, context: ContextId, request_id: u64) -> WireMessage {
    let mut message = WireMessage::call(operation, context);
    message.set_request_id(request_id);
    message
}

fn framed(messages: &[WireMessage]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for message in messages {
        write_frame(&mut bytes, &message.encode().expect("encode")).expect("frame");
    }
    bytes
}

fn replies(bytes: Vec<u8>) -> Vec<WireMessage> {
    let mut reader = Cursor::new(bytes);
    let mut decoded = Vec::new();
    while let ReadOutcome::Frame(frame) = read_frame(&mut reader).expect("read frame") {
        decoded.push(WireMessage::decode(&frame).expect("decode"));
    }
    decoded
}

#[test]
fn arguments_parse() {
    let parsed = args("auth", "org.example.auth");

    assert_eq!(parsed.capability, Capability::Auth);
    assert_eq!(parsed.package_id, "org.example.auth");
    assert_eq!(parsed.path, "/plugins/libadaptor_plugin_sample.so");
    assert!(!parsed.log_filter.is_empty());
}

#[rstest]
#[case("json", LogFormat::Json)]
#[case("COMPACT", LogFormat::Compact)]
fn log_format_follows_the_flag(#[case] flag: &str, #[case] expected: LogFormat) {
    let parsed = parse_args([
        "adaptor-plugin-host",
        "--capability",
        "auth",
        "--package",
        SAMPLE_URI,
        "--log-format",
        flag,
        "/p.so",
    ])
    .expect("valid arguments");

    assert_eq!(parsed.log_format, expected);
}

#[rstest]
#[case::missing_package(&["adaptor-plugin-host", "--capability", "auth", "/p.so"])]
#[case::missing_path(&["adaptor-plugin-host", "--capability", "auth", "--package", "x"])]
#[case::unknown_capability(&[
    "adaptor-plugin-host", "--capability", "billing", "--package", "x", "/p.so",
])]
#[case::unknown_log_format(&[
    "adaptor-plugin-host", "--capability", "auth", "--package", "x", "--log-format", "xml",
    "/p.so",
])]
fn bad_arguments_are_usage_errors(#[case] argv: &[&str]) {
    let error = parse_args(argv.iter().copied()).expect_err("rejected");

    assert!(matches!(error, HostError::Args(_)));
    assert_eq!(error.exit_code(), 2);
}

#[test]
fn help_is_reported_through_clap() {
    let error = parse_args(["adaptor-plugin-host", "--help"]).expect_err("help");

    assert!(matches!(
        error,
        HostError::Args(ref inner) if inner.kind() == ErrorKind::DisplayHelp
    ));
}

#[test]
fn malformed_log_filter_is_rejected() {
    let error = init_logging("adaptor=verbose", LogFormat::Compact).expect_err("bad filter");

    assert!(matches!(error, HostError::Filter(_)));
}

#[rstest]
fn sample_plugin_passes_verification(sample: LibraryBackend) {
    verify(&args("auth", SAMPLE_URI), &sample).expect("matching plugin");
}

#[rstest]
fn wrong_capability_is_rejected(sample: LibraryBackend) {
    let error = verify(&args("push", SAMPLE_URI), &sample).expect_err("mismatch");

    assert!(matches!(
        error,
        HostError::CapabilityMismatch {
            expected: Capability::Push,
            found: Capability::Auth,
            ..
        }
    ));
    assert_eq!(error.exit_code(), 3);
}

#[rstest]
fn wrong_package_is_rejected(sample: LibraryBackend) {
    let error = verify(&args("auth", "org.example.other"), &sample).expect_err("mismatch");

    assert!(matches!(
        error,
        HostError::PackageMismatch { ref found, .. } if found == SAMPLE_URI
    ));
}

#[test]
fn unloadable_library_fails_to_load() {
    let dir = TempDir::new().expect("temp dir");
    let path = Utf8Path::from_path(dir.path())
        .expect("utf-8 path")
        .join("libbroken.so");
    std::fs::write(&path, b"not a shared object").expect("write");
    let mut host_args = args("auth", SAMPLE_URI);
    host_args.path = path;
    let mut output = Vec::new();

    let error = run(&host_args, &mut Cursor::new(Vec::new()), &mut output).expect_err("load");

    assert!(matches!(error, HostError::Load { .. }));
    assert!(output.is_empty());
}

#[rstest]
fn serve_answers_every_request(mut sample: LibraryBackend) {
    let create = request(Operation::CreateContext, ContextId::NONE, 1)
        .with_params(Credentials::new("alice", "app", "secret").to_params());
    let stray = request(Operation::IsAuth, ContextId::from_raw(9_999), 2);
    let mut input = Cursor::new(framed(&[create, stray]));
    let mut output = Vec::new();

    let answered = serve(&mut sample, &mut input, &mut output).expect("clean disconnect");

    assert_eq!(answered, 2);
    let replies = replies(output);
    let [created, rejected] = replies.as_slice() else {
        panic!("expected two replies, got {replies:?}");
    };
    assert_eq!(created.request_id(), 1);
    assert_eq!(created.result_code(), Some(StatusCode::None.code()));
    assert!(created.param_num(1).is_some_and(|id| id > 0));
    assert_eq!(rejected.request_id(), 2);
    assert_eq!(
        rejected.result_code(),
        Some(StatusCode::InvalidArgument.code())
    );
}

#[rstest]
fn truncated_input_is_a_channel_error(mut sample: LibraryBackend) {
    let mut bytes = framed(&[request(Operation::IsAuth, ContextId::NONE, 1)]);
    bytes.truncate(bytes.len() - 3);
    let mut output = Vec::new();

    let error = serve(&mut sample, &mut Cursor::new(bytes), &mut output).expect_err("truncated");

    assert!(matches!(error, HostError::Channel(FramingError::Truncated { .. })));
    assert_eq!(error.exit_code(), 4);
}
