use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use claims::{assert_err, assert_none, assert_ok, assert_some};

use bulkmail::campaign::{CampaignError, OutcomeStatus, SenderMode};
use bulkmail::configuration::QuotaOverflow;
use bulkmail::domain::OwnerId;
use bulkmail::normalize::NormalizeError;
use bulkmail::selector::SelectError;

use crate::helpers::{
    BrokenSource, FakeTransport, harness, harness_with, request_for, sheet_of,
};

#[tokio::test]
async fn every_valid_recipient_yields_exactly_one_outcome_row() {
    let h = harness(
        15,
        FakeTransport::with_hook(|call, _| {
            if call == 1 || call == 3 {
                Err("550 mailbox unavailable".to_string())
            } else {
                Ok(())
            }
        }),
    );
    let owner = OwnerId::new();
    h.quota.add_account(owner, "sender@x.com", 0);

    let recipients = ["a@x.com", "b@x.com", "c@x.com", "d@x.com", "e@x.com"];
    let handle = assert_ok!(
        h.dispatcher
            .start(owner, request_for(sheet_of(&recipients)))
            .await
    );
    let summary = assert_ok!(handle.wait().await);

    assert_eq!(summary.total, 5);
    assert_eq!(summary.sent, 3);
    assert_eq!(summary.failed, 2);
    assert!(!summary.halted);
    assert_eq!(summary.first_failures.len(), 2);
    assert_eq!(summary.first_failures[0], "b@x.com: 550 mailbox unavailable");

    let (log, outcomes) = h.store.single_log();
    assert_eq!(log.sent_count + log.failed_count, log.total_emails);
    assert_eq!(outcomes.len(), 5);

    let covered: HashSet<&str> = outcomes.iter().map(|o| o.recipient.as_str()).collect();
    let expected: HashSet<&str> = recipients.into_iter().collect();
    assert_eq!(covered, expected);

    let failed: Vec<_> = outcomes
        .iter()
        .filter(|o| o.status == OutcomeStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 2);
    assert!(
        failed
            .iter()
            .all(|o| o.error.as_deref() == Some("550 mailbox unavailable"))
    );

    let state = assert_some!(h.registry.snapshot(owner));
    assert!(!state.is_sending);
    assert_eq!(state.sent, 3);
    assert_eq!(state.failed, 2);
}

#[tokio::test]
async fn rows_with_a_blank_email_column_are_not_counted_as_failures() {
    let h = harness(15, FakeTransport::always_ok());
    let owner = OwnerId::new();
    h.quota.add_account(owner, "sender@x.com", 0);

    let sheet = sheet_of(&["a@x.com", "", "b@x.com", "   ", "c@x.com", "d@x.com", "e@x.com"]);
    let handle = assert_ok!(h.dispatcher.start(owner, request_for(sheet)).await);
    let summary = assert_ok!(handle.wait().await);

    assert_eq!(summary.total, 5);
    assert_eq!(summary.sent, 5);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn subject_and_body_are_personalized_per_row() {
    let h = harness(15, FakeTransport::always_ok());
    let owner = OwnerId::new();
    h.quota.add_account(owner, "sender@x.com", 0);

    let handle = assert_ok!(
        h.dispatcher
            .start(owner, request_for(sheet_of(&["ana@x.com"])))
            .await
    );
    assert_ok!(handle.wait().await);

    let sent = h.transport.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Hello user0");
    assert_eq!(sent[0].text, "Hi user0!");
    assert!(sent[0].html.contains("Hi user0!"));
    assert!(sent[0].html.starts_with("<div style=\""));
}

#[tokio::test]
async fn cc_and_bcc_merge_form_entries_with_the_senders_defaults() {
    let h = harness(15, FakeTransport::always_ok());
    let owner = OwnerId::new();
    h.quota
        .add_account_full(owner, "sender@x.com", 0, crate::helpers::today(), "b@x,c@x", "z@x");

    let mut request = request_for(sheet_of(&["ana@x.com"]));
    request.cc = "a@x,b@x".to_string();
    request.bcc = "z@x,y@x".to_string();

    let handle = assert_ok!(h.dispatcher.start(owner, request).await);
    assert_ok!(handle.wait().await);

    let sent = h.transport.sent.lock();
    assert_eq!(sent[0].cc, vec!["a@x", "b@x", "c@x"]);
    assert_eq!(sent[0].bcc, vec!["z@x", "y@x"]);
}

#[tokio::test]
async fn auto_rotation_distributes_the_batch_across_accounts() {
    let h = harness(2, FakeTransport::always_ok());
    let owner = OwnerId::new();
    h.quota.add_account(owner, "first@x.com", 0);
    h.quota.add_account(owner, "second@x.com", 0);
    h.quota.add_account(owner, "third@x.com", 0);

    let sheet = sheet_of(&["a@x.com", "b@x.com", "c@x.com", "d@x.com", "e@x.com"]);
    let handle = assert_ok!(h.dispatcher.start(owner, request_for(sheet)).await);
    let summary = assert_ok!(handle.wait().await);

    assert_eq!(summary.sent, 5);
    assert_eq!(summary.rotation.get("first@x.com"), Some(&2));
    assert_eq!(summary.rotation.get("second@x.com"), Some(&2));
    assert_eq!(summary.rotation.get("third@x.com"), Some(&1));

    // Confirmed sends were credited to the right accounts.
    assert_eq!(h.quota.sent_count(owner, "first@x.com"), Some(2));
    assert_eq!(h.quota.sent_count(owner, "second@x.com"), Some(2));
    assert_eq!(h.quota.sent_count(owner, "third@x.com"), Some(1));
}

#[tokio::test]
async fn soft_overflow_keeps_sending_through_the_oldest_account() {
    let h = harness(15, FakeTransport::always_ok());
    let owner = OwnerId::new();
    h.quota.add_account(owner, "oldest@x.com", 15);
    h.quota.add_account(owner, "newer@x.com", 15);

    let handle = assert_ok!(
        h.dispatcher
            .start(owner, request_for(sheet_of(&["a@x.com", "b@x.com"])))
            .await
    );
    let summary = assert_ok!(handle.wait().await);

    assert_eq!(summary.sent, 2);
    assert!(!summary.halted);
    assert_eq!(summary.rotation.get("oldest@x.com"), Some(&2));
}

#[tokio::test]
async fn hard_overflow_halts_the_batch_and_persists_an_empty_log() {
    let h = harness_with(15, FakeTransport::always_ok(), QuotaOverflow::Hard);
    let owner = OwnerId::new();
    h.quota.add_account(owner, "a@x.com", 15);

    let handle = assert_ok!(
        h.dispatcher
            .start(owner, request_for(sheet_of(&["a@x.com", "b@x.com"])))
            .await
    );
    let summary = assert_ok!(handle.wait().await);

    assert_eq!(summary.sent, 0);
    assert!(summary.halted);
    assert_eq!(h.transport.calls(), 0);

    let (log, outcomes) = h.store.single_log();
    assert!(log.halted);
    assert_eq!(log.total_emails, 2);
    assert!(outcomes.is_empty());
}

#[tokio::test]
async fn manual_mode_pins_one_sender_for_the_whole_batch() {
    let h = harness(15, FakeTransport::always_ok());
    let owner = OwnerId::new();
    h.quota.add_account(owner, "first@x.com", 0);
    h.quota.add_account(owner, "pinned@x.com", 0);

    let mut request = request_for(sheet_of(&["a@x.com", "b@x.com", "c@x.com"]));
    request.mode = SenderMode::Manual;
    request.pinned_sender = Some("pinned@x.com".to_string());

    let handle = assert_ok!(h.dispatcher.start(owner, request).await);
    let summary = assert_ok!(handle.wait().await);

    assert_eq!(summary.sent, 3);
    assert_eq!(summary.rotation.get("pinned@x.com"), Some(&3));
    assert!(
        h.transport
            .sent
            .lock()
            .iter()
            .all(|mail| mail.sender == "pinned@x.com")
    );
}

#[tokio::test]
async fn manual_mode_with_insufficient_quota_is_rejected_before_any_send() {
    let h = harness(15, FakeTransport::always_ok());
    let owner = OwnerId::new();
    h.quota.add_account(owner, "pinned@x.com", 10);

    let mut request = request_for(sheet_of(&[
        "a@x.com", "b@x.com", "c@x.com", "d@x.com", "e@x.com", "f@x.com",
    ]));
    request.mode = SenderMode::Manual;
    request.pinned_sender = Some("pinned@x.com".to_string());

    let err = assert_err!(h.dispatcher.start(owner, request).await);
    assert!(matches!(
        err,
        CampaignError::Select(SelectError::InsufficientQuota {
            requested: 6,
            remaining: 5,
            ..
        })
    ));
    assert_eq!(h.transport.calls(), 0);
    assert!(h.store.persisted.lock().is_empty());
}

#[tokio::test]
async fn manual_mode_without_a_selected_sender_is_rejected() {
    let h = harness(15, FakeTransport::always_ok());
    let owner = OwnerId::new();
    h.quota.add_account(owner, "a@x.com", 0);

    let mut request = request_for(sheet_of(&["a@x.com"]));
    request.mode = SenderMode::Manual;
    request.pinned_sender = Some(String::new());

    let err = assert_err!(h.dispatcher.start(owner, request).await);
    assert!(matches!(err, CampaignError::NoPinnedSender));
}

#[tokio::test]
async fn an_unreadable_source_fails_fast_without_touching_state() {
    let h = harness(15, FakeTransport::always_ok());
    let owner = OwnerId::new();
    h.quota.add_account(owner, "a@x.com", 0);

    let mut request = request_for(sheet_of(&[]));
    request.source = Arc::new(BrokenSource);

    let err = assert_err!(h.dispatcher.start(owner, request).await);
    assert!(matches!(err, CampaignError::Source(_)));
    assert_eq!(h.transport.calls(), 0);
    assert_none!(h.registry.snapshot(owner));
}

#[tokio::test]
async fn a_missing_email_column_fails_fast() {
    let h = harness(15, FakeTransport::always_ok());
    let owner = OwnerId::new();
    h.quota.add_account(owner, "a@x.com", 0);

    let mut request = request_for(sheet_of(&["a@x.com"]));
    request.email_column = "address".to_string();

    let err = assert_err!(h.dispatcher.start(owner, request).await);
    assert!(matches!(
        err,
        CampaignError::Normalize(NormalizeError::MissingColumn(_))
    ));
}

#[tokio::test]
async fn an_owner_without_accounts_cannot_start_a_campaign() {
    let h = harness(15, FakeTransport::always_ok());
    let owner = OwnerId::new();

    let err = assert_err!(
        h.dispatcher
            .start(owner, request_for(sheet_of(&["a@x.com"])))
            .await
    );
    assert!(matches!(err, CampaignError::NoAccounts));
}

#[tokio::test]
async fn a_second_concurrent_campaign_for_the_same_owner_is_rejected() {
    let h = harness(15, FakeTransport::always_ok());
    let owner = OwnerId::new();
    h.quota.add_account(owner, "a@x.com", 0);

    let mut slow = request_for(sheet_of(&["a@x.com", "b@x.com", "c@x.com"]));
    slow.delay = Duration::from_millis(50);

    let handle = assert_ok!(h.dispatcher.start(owner, slow).await);

    let err = assert_err!(
        h.dispatcher
            .start(owner, request_for(sheet_of(&["d@x.com"])))
            .await
    );
    assert!(matches!(err, CampaignError::AlreadyRunning));

    assert_ok!(handle.wait().await);

    // The slot frees up once the first campaign completes.
    let handle = assert_ok!(
        h.dispatcher
            .start(owner, request_for(sheet_of(&["d@x.com"])))
            .await
    );
    assert_ok!(handle.wait().await);
}

#[tokio::test]
async fn campaigns_of_different_owners_run_independently() {
    let h = harness(15, FakeTransport::always_ok());
    let first = OwnerId::new();
    let second = OwnerId::new();
    h.quota.add_account(first, "a@x.com", 0);
    h.quota.add_account(second, "b@x.com", 0);

    let mut slow = request_for(sheet_of(&["a@x.com", "b@x.com"]));
    slow.delay = Duration::from_millis(50);

    let first_handle = assert_ok!(h.dispatcher.start(first, slow).await);
    let second_handle = assert_ok!(
        h.dispatcher
            .start(second, request_for(sheet_of(&["c@x.com"])))
            .await
    );

    assert_ok!(first_handle.wait().await);
    assert_ok!(second_handle.wait().await);
    assert_eq!(h.store.persisted.lock().len(), 2);
}

#[tokio::test]
async fn cancellation_stops_the_loop_and_persists_partial_results() {
    // Cancel from inside the first send so exactly one recipient is
    // processed before the loop observes the token.
    let quota = Arc::new(crate::helpers::InMemoryQuotaStore::new(15));
    let owner = OwnerId::new();
    quota.add_account(owner, "sender@x.com", 0);

    let registry = Arc::new(bulkmail::campaign::StatusRegistry::new());
    let registry_for_hook = registry.clone();
    let transport = FakeTransport::with_hook(move |call, _| {
        if call == 0 {
            registry_for_hook.cancel(owner);
        }
        Ok(())
    });

    let store = Arc::new(crate::helpers::InMemoryCampaignStore::default());
    let dispatcher = bulkmail::campaign::Dispatcher::new(
        quota,
        Arc::new(transport),
        store.clone(),
        registry,
        QuotaOverflow::Soft,
    );

    let sheet = sheet_of(&["a@x.com", "b@x.com", "c@x.com", "d@x.com"]);
    let handle = assert_ok!(dispatcher.start(owner, request_for(sheet)).await);
    let summary = assert_ok!(handle.wait().await);

    assert!(summary.cancelled);
    assert_eq!(summary.sent, 1);

    let (log, outcomes) = store.single_log();
    assert!(log.halted);
    assert_eq!(log.sent_count, 1);
    assert_eq!(outcomes.len(), 1);
}

#[tokio::test]
async fn losing_every_sender_mid_batch_halts_but_keeps_prior_results() {
    // Limit 1 forces a fresh selection per recipient; the first send
    // deactivates every account, so the second selection finds none.
    let quota = Arc::new(crate::helpers::InMemoryQuotaStore::new(1));
    let owner = OwnerId::new();
    quota.add_account(owner, "sender@x.com", 0);

    let quota_for_hook = quota.clone();
    let transport = FakeTransport::with_hook(move |call, _| {
        if call == 0 {
            quota_for_hook.deactivate_all(owner);
        }
        Ok(())
    });

    let store = Arc::new(crate::helpers::InMemoryCampaignStore::default());
    let registry = Arc::new(bulkmail::campaign::StatusRegistry::new());
    let dispatcher = bulkmail::campaign::Dispatcher::new(
        quota.clone(),
        Arc::new(transport),
        store.clone(),
        registry,
        QuotaOverflow::Soft,
    );

    let sheet = sheet_of(&["a@x.com", "b@x.com", "c@x.com"]);
    let handle = assert_ok!(dispatcher.start(owner, request_for(sheet)).await);
    let summary = assert_ok!(handle.wait().await);

    assert!(summary.halted);
    assert_eq!(summary.sent, 1);
    assert_eq!(summary.failed, 0);

    let (log, outcomes) = store.single_log();
    assert!(log.halted);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].recipient, "a@x.com");
}
