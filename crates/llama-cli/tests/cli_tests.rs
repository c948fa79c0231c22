//! Integration tests for the command-line front end.
//!
//! Validates:
//! - Argument parsing for query / retrieve / chat
//! - End-to-end answers from a model card on disk, cleaned and raw
//! - Retrieval listing order and the empty case
//! - Init failures carry the C status code

// These drive the scripted backend with JSON model cards.
#![cfg(not(feature = "native"))]

use std::io::{Cursor, Write};

use clap::Parser;
use llama_cli::{run, Cli, CliError, Command};
use tempfile::NamedTempFile;

const CARD: &str = r#"{
    "vocab": ["<unk>", "<s>", "</s>", "▁How", "▁long", "▁is", "▁the", "▁warranty?",
              "▁Two", "▁years."],
    "reply": ["Two", "years."]
}"#;

fn file_with(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

fn run_args(argv: &[&str], stdin: &str) -> Result<String, CliError> {
    let cli = Cli::try_parse_from(argv).unwrap();
    let mut out = Vec::new();
    run(cli, Cursor::new(stdin.to_owned()), &mut out)?;
    Ok(String::from_utf8(out).unwrap())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[test]
fn knowledge_flags_are_global_and_repeatable() {
    let cli = Cli::try_parse_from([
        "llama-rag", "retrieve", "-q", "x", "-k", "a.txt", "--knowledge", "b.txt", "--doc", "d",
    ])
    .unwrap();
    assert_eq!(cli.knowledge.len(), 2);
    assert_eq!(cli.docs, vec!["d"]);
    assert!(matches!(cli.command, Command::Retrieve { top_k: 3, .. }));
}

#[test]
fn query_requires_a_model() {
    assert!(Cli::try_parse_from(["llama-rag", "query", "-p", "hi"]).is_err());
}

// ---------------------------------------------------------------------------
// query / chat
// ---------------------------------------------------------------------------

#[test]
fn query_prints_cleaned_answer() {
    let model = file_with(CARD);
    let path = model.path().to_str().unwrap();
    let out = run_args(
        &["llama-rag", "query", "-m", path, "-p", "How long is the warranty?"],
        "",
    )
    .unwrap();
    assert_eq!(out, "Two years.\n");
}

#[test]
fn raw_flag_keeps_word_markers() {
    let model = file_with(CARD);
    let path = model.path().to_str().unwrap();
    let out = run_args(
        &["llama-rag", "query", "-m", path, "--raw", "-p", "warranty"],
        "",
    )
    .unwrap();
    assert_eq!(out, "\u{2581}Two\u{2581}years.\n");
}

#[test]
fn token_budget_override_truncates() {
    let model = file_with(CARD);
    let path = model.path().to_str().unwrap();
    let out = run_args(
        &["llama-rag", "query", "-m", path, "--max-new-tokens", "1", "-p", "warranty"],
        "",
    )
    .unwrap();
    assert_eq!(out, "Two\n");
}

#[test]
fn context_window_override_rejects_long_prompts() {
    let model = file_with(CARD);
    let path = model.path().to_str().unwrap();
    let out = run_args(
        &["llama-rag", "query", "-m", path, "--context-window", "2", "-p", "How long is it"],
        "",
    )
    .unwrap();
    assert_eq!(out, "Prompt too long for model context window.\n");
}

#[test]
fn chat_answers_until_exit() {
    let model = file_with(CARD);
    let faq = file_with("The warranty lasts two years.\n");
    let out = run_args(
        &[
            "llama-rag",
            "chat",
            "-m",
            model.path().to_str().unwrap(),
            "-k",
            faq.path().to_str().unwrap(),
        ],
        "How long?\n\n   \nwarranty\nexit\nnever asked\n",
    )
    .unwrap();
    assert_eq!(out, "Two years.\nTwo years.\n");
}

// ---------------------------------------------------------------------------
// retrieve
// ---------------------------------------------------------------------------

#[test]
fn retrieve_lists_best_matches_first() {
    let faq = file_with("dog\ncat\ncat dog\n");
    let out = run_args(
        &[
            "llama-rag",
            "retrieve",
            "-k",
            faq.path().to_str().unwrap(),
            "--doc",
            "dog cat",
            "-q",
            "cat dog",
            "-n",
            "2",
        ],
        "",
    )
    .unwrap();
    assert_eq!(out, "2\t#2\tcat dog\n2\t#3\tdog cat\n");
}

#[test]
fn retrieve_without_matches() {
    let out = run_args(&["llama-rag", "retrieve", "--doc", "alpha", "-q", "beta"], "").unwrap();
    assert_eq!(out, "no matching documents\n");
}

#[test]
fn retrieve_reports_unreadable_knowledge() {
    let result = run_args(
        &["llama-rag", "retrieve", "-k", "/no/such/faq.txt", "-q", "x"],
        "",
    );
    assert!(matches!(result, Err(CliError::Knowledge(_))));
}

// ---------------------------------------------------------------------------
// init failures
// ---------------------------------------------------------------------------

#[test]
fn missing_model_reports_status_10() {
    let err = run_args(
        &["llama-rag", "query", "-m", "/no/such/model.json", "-p", "hi"],
        "",
    )
    .unwrap_err();
    assert!(matches!(err, CliError::Init { code: 10, .. }));
}

#[test]
fn malformed_model_reports_status_1() {
    let model = file_with("{");
    let err = run_args(
        &["llama-rag", "query", "-m", model.path().to_str().unwrap(), "-p", "hi"],
        "",
    )
    .unwrap_err();
    assert!(matches!(err, CliError::Init { code: 1, .. }));
}
