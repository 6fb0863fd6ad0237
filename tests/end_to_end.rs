//! End-to-end workflow tests
//!
//! Evidence from submission through checkpointing to independent
//! verification, plus the legal-hold and retention lifecycle.

#[allow(dead_code)]
mod common;

use common::*;
use evidence_vault::checkpoint::{merkle_root, verify_checkpoint, verify_proof};
use evidence_vault::ledger::{verify_entries, GENESIS_HASH};
use evidence_vault::observability::TamperKind;
use evidence_vault::{AuditEvent, ErrorKind, EvidenceSubmission, RetentionMode, RetentionPolicy};

// =============================================================================
// Submission to checkpoint
// =============================================================================

#[tokio::test]
async fn test_ctrl_x_submission_is_checkpointed() {
    let tv = vault_on(object_lock_backend()).await;
    let vault = &tv.vault;
    let head_before = vault.ledger().head_hash().await;
    assert_eq!(head_before, GENESIS_HASH);

    let submitted = vault
        .submit_evidence(
            "controls/ctrl-x/firewall-review.pdf",
            &b"%PDF-1.7 firewall rule review"[..],
            EvidenceSubmission::for_control("ctrl-x").with_content_type("application/pdf"),
            "alice@example.com",
        )
        .await
        .unwrap();

    let entry = &submitted.audit_entry;
    assert_eq!(entry.event, AuditEvent::EvidenceSubmitted);
    assert_eq!(entry.previous_hash, head_before);
    assert_eq!(entry.recompute_hash(), entry.current_hash);
    assert_eq!(entry.details["control_id"], "ctrl-x");
    assert_eq!(entry.details["content_hash"], submitted.stored.content_hash);
    assert_eq!(entry.leaf_hash(), Some(submitted.leaf_hash.as_str()));

    let first = vault.run_checkpoint().await.unwrap().unwrap();
    assert_eq!(first.previous_checkpoint, None);
    assert_eq!(first.event_count, 1);
    assert_eq!(first.merkle_root, merkle_root(&[submitted.leaf_hash.clone()]).unwrap());

    let proof = vault
        .prove_evidence("controls/ctrl-x/firewall-review.pdf")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(proof.checkpoint.checkpoint_id, first.checkpoint_id);
    assert_eq!(proof.proof.leaf, submitted.leaf_hash);
    assert!(verify_proof(&proof.proof, &first.merkle_root));
    assert!(proof.verify());

    // A second submission lands in a checkpoint chained to the first.
    let more = vault
        .submit_evidence(
            "controls/ctrl-x/firewall-review-q2.pdf",
            &b"%PDF-1.7 q2"[..],
            EvidenceSubmission::for_control("ctrl-x"),
            "alice@example.com",
        )
        .await
        .unwrap();
    let second = vault.run_checkpoint().await.unwrap().unwrap();
    assert_eq!(second.previous_checkpoint.as_deref(), Some(first.checkpoint_id.as_str()));
    verify_checkpoint(&second, &[more.leaf_hash], &vault.public_key_hex()).unwrap();

    let entries = vault.ledger().entries().await.unwrap();
    verify_entries(&entries).unwrap();
    let created: Vec<_> = entries
        .iter()
        .filter(|e| e.event == AuditEvent::CheckpointCreated)
        .map(|e| e.details["checkpoint_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(created, vec![first.checkpoint_id, second.checkpoint_id]);
}

#[tokio::test]
async fn test_submission_uses_default_compliance_retention() {
    let tv = vault_on(blob_backend()).await;
    let vault = tv.vault.with_default_retention(RetentionPolicy::compliance(2557));

    let submitted = vault
        .submit_evidence("pci/3.4/keys.txt", &b"redacted"[..], EvidenceSubmission::for_control("3.4"), "svc")
        .await
        .unwrap();
    let retention = submitted.stored.retention.unwrap();
    assert_eq!(retention.mode, RetentionMode::Compliance);

    assert_storage_kind(vault.delete_evidence("pci/3.4/keys.txt", "admin").await, ErrorKind::PermissionDenied);
    assert!(vault.storage().exists("pci/3.4/keys.txt").await.unwrap());

    // A duplicate submission fails and leaves no trace in the ledger.
    let before = vault.ledger().len().await;
    assert_storage_kind(
        vault
            .submit_evidence("pci/3.4/keys.txt", &b"other"[..], EvidenceSubmission::for_control("3.4"), "svc")
            .await,
        ErrorKind::AlreadyExists,
    );
    assert_eq!(vault.ledger().len().await, before);
}

// =============================================================================
// Hold and retention lifecycle
// =============================================================================

#[tokio::test]
async fn test_hold_and_retention_lifecycle_is_audited() {
    let tv = vault_on(object_lock_backend()).await;
    let vault = &tv.vault;
    let key = "sox/302/certification.pdf";
    vault
        .submit_evidence(
            key,
            &b"certified"[..],
            EvidenceSubmission::for_control("302").with_retention(RetentionPolicy::governance(0)),
            "cfo",
        )
        .await
        .unwrap();

    vault.apply_legal_hold(key, "counsel", "matter 42").await.unwrap();
    assert_storage_kind(vault.delete_evidence(key, "admin").await, ErrorKind::PermissionDenied);

    let applied = vault
        .extend_retention(key, RetentionPolicy::compliance(30), false, "records-manager")
        .await
        .unwrap();
    assert_eq!(applied.mode, RetentionMode::Compliance);
    assert_storage_kind(
        vault
            .extend_retention(key, RetentionPolicy::compliance(1), true, "records-manager")
            .await,
        ErrorKind::PermissionDenied,
    );

    vault.remove_legal_hold(key, "counsel", "matter closed").await.unwrap();
    // Still under compliance retention.
    assert_storage_kind(vault.delete_evidence(key, "admin").await, ErrorKind::PermissionDenied);

    let events: Vec<AuditEvent> = vault
        .ledger()
        .entries_for_key(key)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event)
        .collect();
    assert_eq!(
        events,
        vec![
            AuditEvent::EvidenceSubmitted,
            AuditEvent::LegalHoldApplied,
            AuditEvent::RetentionExtended,
            AuditEvent::LegalHoldRemoved,
        ]
    );
}

#[tokio::test]
async fn test_expired_unheld_evidence_can_be_deleted() {
    let env = TestEnv::new();
    let tv = vault_on(relational_backend(&env).await).await;
    let vault = &tv.vault;
    vault
        .submit_evidence("tmp/scratch.txt", &b"x"[..], EvidenceSubmission::for_control("none"), "u")
        .await
        .unwrap();
    vault.delete_evidence("tmp/scratch.txt", "admin").await.unwrap();
    assert!(!vault.storage().exists("tmp/scratch.txt").await.unwrap());

    let last = vault.ledger().entries().await.unwrap().pop().unwrap();
    assert_eq!(last.event, AuditEvent::EvidenceDeleted);
    assert_eq!(last.evidence_key(), Some("tmp/scratch.txt"));
}

#[tokio::test]
async fn test_archive_backend_refuses_legal_hold() {
    let env = TestEnv::new();
    let tv = vault_on(archive_backend(&env).await).await;
    tv.vault
        .submit_evidence("cold/2019/report.pdf", &b"x"[..], EvidenceSubmission::for_control("c"), "u")
        .await
        .unwrap();
    let before = tv.vault.ledger().len().await;
    assert_storage_kind(
        tv.vault.apply_legal_hold("cold/2019/report.pdf", "counsel", "matter").await,
        ErrorKind::NotSupported,
    );
    assert_eq!(tv.vault.ledger().len().await, before);
}

// =============================================================================
// Tampering
// =============================================================================

#[tokio::test]
async fn test_tampered_evidence_is_reported() {
    let env = TestEnv::new();
    for backend in all_backends(&env).await {
        let name = backend.name;
        let tv = vault_on(backend).await;
        tv.vault
            .submit_evidence("gdpr/dpia.docx", &b"assessment v1"[..], EvidenceSubmission::for_control("Art.35"), "dpo")
            .await
            .unwrap();
        assert!(tv.vault.verify_evidence("gdpr/dpia.docx", "auditor").await.unwrap(), "{}", name);

        assert!(tv.medium.tamper("gdpr/dpia.docx", b"assessment v2"), "{}", name);
        assert!(!tv.vault.verify_evidence("gdpr/dpia.docx", "auditor").await.unwrap(), "{}", name);

        let alerts = tv.alerts.alerts();
        assert_eq!(alerts.len(), 1, "{}", name);
        assert_eq!(alerts[0].kind, TamperKind::ContentHash);
        assert_eq!(alerts[0].subject, "gdpr/dpia.docx");

        let last = tv.vault.ledger().entries().await.unwrap().pop().unwrap();
        assert_eq!(last.event, AuditEvent::IntegrityViolation);
        // The ledger itself is still intact.
        assert!(tv.vault.verify_audit_chain("auditor").await.is_ok(), "{}", name);
    }
}
