// Tests for the directory mailbox protocol

use onionweave_core::mailbox::{
    self, CLAIMED_SUFFIX, ClaimOrder, DirMailbox, Mailbox, Message, NameGenerator,
    PRIORITY_ACCEPT_PATTERN,
};
use serde_json::json;
use std::collections::HashSet;
use std::fs;
use std::thread;
use tempfile::TempDir;

fn create_test_mailbox() -> (TempDir, DirMailbox) {
    let temp_dir = TempDir::new().unwrap();
    let mailbox = DirMailbox::new(temp_dir.path().join("inbox")).unwrap();
    mailbox.ensure().unwrap();
    (temp_dir, mailbox)
}

fn message(url: &str) -> Message {
    let mut message = Message::new();
    message.insert("url".to_string(), json!(url));
    message
}

// ============================================================================
// Claim / Complete Tests
// ============================================================================

#[test]
fn test_deliver_claim_complete() {
    let (_temp_dir, inbox) = create_test_mailbox();
    inbox.deliver(&message("http://a.onion/"), "Seed_1_2_3").unwrap();

    let claim = inbox.claim().unwrap().expect("message should be claimable");
    assert_eq!(claim.name(), "Seed_1_2_3");
    assert!(claim.path().to_string_lossy().ends_with(CLAIMED_SUFFIX));
    assert!(!inbox.path().join("Seed_1_2_3").exists());

    let read = inbox.read(&claim).unwrap();
    assert_eq!(read["url"], "http://a.onion/");

    inbox.complete(claim).unwrap();
    assert!(inbox.is_empty().unwrap());
    assert!(inbox.claim().unwrap().is_none());
}

#[test]
fn test_claimed_message_is_not_claimed_twice() {
    let (_temp_dir, inbox) = create_test_mailbox();
    inbox.deliver(&message("http://a.onion/"), "Seed_1_2_3").unwrap();

    let _claim = inbox.claim().unwrap().unwrap();
    assert!(inbox.claim().unwrap().is_none());
    // Claimed files still count toward the size
    assert_eq!(inbox.len().unwrap(), 1);
}

#[test]
fn test_claim_exclusive_across_threads() {
    let (_temp_dir, inbox) = create_test_mailbox();
    let mut names = NameGenerator::new("Seed", 7);
    for i in 0..200 {
        inbox
            .deliver(&message(&format!("http://{}.onion/", i)), &names.next(""))
            .unwrap();
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let inbox = inbox.clone();
            thread::spawn(move || {
                let mut claimed = Vec::new();
                while let Some(claim) = inbox.claim().unwrap() {
                    claimed.push(claim.name().to_string());
                    inbox.complete(claim).unwrap();
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }

    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 200);
    assert_eq!(unique.len(), 200);
    assert!(inbox.is_empty().unwrap());
}

// ============================================================================
// Filtering and Ordering Tests
// ============================================================================

#[test]
fn test_non_matching_and_temporary_files_ignored() {
    let (_temp_dir, inbox) = create_test_mailbox();
    fs::write(inbox.path().join("README"), "{}").unwrap();
    fs::write(inbox.path().join(".Seed_1_2_3.tmp"), "{}").unwrap();
    fs::write(inbox.path().join("Seed_1_2"), "{}").unwrap();

    assert!(inbox.claim().unwrap().is_none());

    let census = inbox.census().unwrap();
    assert_eq!(census.pending, 0);
    assert_eq!(census.other, 2);
    // Temporary files are invisible
    assert_eq!(inbox.len().unwrap(), 2);
}

#[test]
fn test_custom_pattern() {
    let temp_dir = TempDir::new().unwrap();
    let inbox = DirMailbox::new(temp_dir.path())
        .unwrap()
        .with_pattern("job-[0-9]+")
        .unwrap();

    assert!(inbox.accepts("job-12"));
    assert!(!inbox.accepts("job-12x"));
    assert!(!inbox.accepts("Seed_1_2_3"));
}

#[test]
fn test_invalid_pattern_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let result = DirMailbox::new(temp_dir.path()).unwrap().with_pattern("([a-z");
    assert!(result.is_err());
}

#[test]
fn test_priority_order() {
    let temp_dir = TempDir::new().unwrap();
    let inbox = DirMailbox::new(temp_dir.path())
        .unwrap()
        .with_pattern(PRIORITY_ACCEPT_PATTERN)
        .unwrap()
        .with_order(ClaimOrder::Priority);

    inbox.deliver(&message("late"), "5-Fetcher_1_1_1").unwrap();
    inbox.deliver(&message("mid"), "2-Fetcher_1_1_2").unwrap();
    inbox.deliver(&message("first"), "0-Seed_1_1_3").unwrap();

    let order: Vec<String> = std::iter::from_fn(|| {
        let claim = inbox.claim().unwrap()?;
        let url = inbox.read(&claim).unwrap()["url"].as_str().unwrap().to_string();
        inbox.complete(claim).unwrap();
        Some(url)
    })
    .collect();

    assert_eq!(order, vec!["first", "mid", "late"]);
}

// ============================================================================
// Failure, Reclaim and Delivery Tests
// ============================================================================

#[test]
fn test_fail_without_dead_letter_deletes() {
    let (_temp_dir, inbox) = create_test_mailbox();
    inbox.deliver(&message("x"), "Seed_1_2_3").unwrap();

    let claim = inbox.claim().unwrap().unwrap();
    inbox.fail(claim).unwrap();
    assert!(inbox.is_empty().unwrap());
}

#[test]
fn test_fail_moves_to_dead_letter() {
    let temp_dir = TempDir::new().unwrap();
    let dead = temp_dir.path().join("dead");
    let inbox = DirMailbox::new(temp_dir.path().join("inbox"))
        .unwrap()
        .with_dead_letter(Some(dead.clone()));
    inbox.ensure().unwrap();
    inbox.deliver(&message("x"), "Seed_1_2_3").unwrap();

    let claim = inbox.claim().unwrap().unwrap();
    inbox.fail(claim).unwrap();

    assert!(inbox.is_empty().unwrap());
    assert!(dead.join("Seed_1_2_3").exists());
}

#[test]
fn test_reclaim_restores_claimed() {
    let (_temp_dir, inbox) = create_test_mailbox();
    inbox.deliver(&message("a"), "Seed_1_2_3").unwrap();
    inbox.deliver(&message("b"), "Seed_1_2_4").unwrap();

    let first = inbox.claim().unwrap().unwrap();
    let second = inbox.claim().unwrap().unwrap();
    // Simulate a crash: the claims are abandoned
    drop((first, second));

    assert!(inbox.claim().unwrap().is_none());
    assert_eq!(inbox.reclaim().unwrap(), 2);
    assert!(inbox.path().join("Seed_1_2_3").exists());
    assert!(inbox.path().join("Seed_1_2_4").exists());
    assert!(inbox.claim().unwrap().is_some());
}

#[test]
fn test_reclaim_missing_directory() {
    let temp_dir = TempDir::new().unwrap();
    let inbox = DirMailbox::new(temp_dir.path().join("nowhere")).unwrap();
    assert_eq!(inbox.reclaim().unwrap(), 0);
}

#[test]
fn test_deliver_rejects_bad_names() {
    let (_temp_dir, inbox) = create_test_mailbox();
    assert!(inbox.deliver(&message("x"), ".hidden").is_err());
    assert!(inbox.deliver(&message("x"), "../escape").is_err());
}

#[test]
fn test_deliver_leaves_no_temporary_files() {
    let (_temp_dir, inbox) = create_test_mailbox();
    inbox.deliver(&message("x"), "Seed_1_2_3").unwrap();

    let entries: Vec<String> = fs::read_dir(inbox.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec!["Seed_1_2_3"]);
}

#[test]
fn test_undecodable_message() {
    let (_temp_dir, inbox) = create_test_mailbox();
    fs::write(inbox.path().join("Seed_1_2_3"), "not json").unwrap();

    let claim = inbox.claim().unwrap().unwrap();
    assert!(inbox.read(&claim).is_err());
}

// ============================================================================
// Capacity Tests
// ============================================================================

#[test]
fn test_capacity_ceiling() {
    let temp_dir = TempDir::new().unwrap();
    let a = DirMailbox::new(temp_dir.path().join("a")).unwrap();
    let b = DirMailbox::new(temp_dir.path().join("b")).unwrap();
    a.ensure().unwrap();
    b.ensure().unwrap();

    let boxes: [&dyn Mailbox; 2] = [&a, &b];
    assert!(mailbox::has_capacity(&boxes, Some(3)).unwrap());
    assert_eq!(mailbox::space(&boxes, Some(3)).unwrap(), Some(3));

    for i in 0..3 {
        a.deliver(&message("x"), &format!("Seed_1_1_{}", i)).unwrap();
    }
    b.deliver(&message("x"), "Seed_1_1_9").unwrap();

    // The fullest mailbox decides
    assert!(!mailbox::has_capacity(&boxes, Some(3)).unwrap());
    assert_eq!(mailbox::space(&boxes, Some(3)).unwrap(), Some(0));

    // No ceiling, no backpressure
    assert!(mailbox::has_capacity(&boxes, None).unwrap());
    assert_eq!(mailbox::space(&boxes, None).unwrap(), None);
}
