//! End-to-end tests over the public database surface.

use emdb_engine::{CancelToken, DatabaseOptions, EmailDatabase, EmailId, TargetBlockSize};
use emdb_types::{CompressionAlgorithm, DatabaseVersion, EncryptionAlgorithm, VersionCompatibility};

fn eml(n: usize) -> Vec<u8> {
    format!(
        "Message-ID: <msg-{n}@example.com>\r\n\
         From: sender{n}@example.com\r\n\
         To: recipient@example.com\r\n\
         Subject: message number {n}\r\n\
         Date: Mon, 2 Oct 2023 09:30:0{} +0000\r\n\
         \r\n\
         This is the body of message {n}. It mentions ticket-{n}.\r\n",
        n % 10
    )
    .into_bytes()
}

fn open_temp(options: DatabaseOptions) -> (tempfile::TempDir, EmailDatabase) {
    let dir = tempfile::tempdir().unwrap();
    let db = EmailDatabase::open(dir.path().join("mail.emdb"), options).unwrap();
    (dir, db)
}

#[test]
fn import_get_roundtrip_and_stats() {
    let (_dir, db) = open_temp(DatabaseOptions::create());
    let mut ids = Vec::new();
    for n in 0..10 {
        ids.push(db.import_eml(eml(n), Some(&format!("mail-{n}.eml"))).unwrap());
    }

    for (n, id) in ids.iter().enumerate() {
        let email = db.get_email(*id).unwrap();
        assert_eq!(email.raw, eml(n), "raw EML must round-trip byte-identically");
    }
    assert_eq!(db.stats().total_emails, 10);
    assert_eq!(db.all_email_ids().unwrap().len(), 10);
}

#[test]
fn lookup_by_message_id() {
    let (_dir, db) = open_temp(DatabaseOptions::create());
    db.import_eml(eml(3), None).unwrap();
    let email = db.get_email_by_message_id("<msg-3@example.com>").unwrap();
    assert_eq!(email.subject, "message number 3");
    assert!(db.get_email_by_message_id("<nope@example.com>").is_err());
}

#[test]
fn emails_survive_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mail.emdb");
    let ids: Vec<EmailId>;
    {
        let db = EmailDatabase::open(&path, DatabaseOptions::create()).unwrap();
        ids = (0..5).map(|n| db.import_eml(eml(n), None).unwrap()).collect();
        db.close().unwrap();
    }
    let db = EmailDatabase::open(&path, DatabaseOptions { create_if_missing: false, ..DatabaseOptions::create() }).unwrap();
    for (n, id) in ids.iter().enumerate() {
        assert_eq!(db.get_email(*id).unwrap().raw, eml(n));
    }
    assert_eq!(db.stats().total_emails, 5);
}

#[test]
fn folder_move_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mail.emdb");
    let ids: Vec<EmailId>;
    {
        let db = EmailDatabase::open(&path, DatabaseOptions::create()).unwrap();
        db.create_folder("Inbox").unwrap();
        db.create_folder("Important").unwrap();
        ids = (0..3).map(|n| db.import_eml(eml(n), None).unwrap()).collect();
        for id in &ids {
            db.add_to_folder(*id, "Inbox").unwrap();
        }
        db.move_email(ids[1], "Inbox", "Important").unwrap();

        let inbox: Vec<EmailId> =
            db.list_folder("Inbox").unwrap().iter().map(|e| e.email_id).collect();
        assert_eq!(inbox, vec![ids[0], ids[2]]);
        let important: Vec<EmailId> =
            db.list_folder("Important").unwrap().iter().map(|e| e.email_id).collect();
        assert_eq!(important, vec![ids[1]]);
        db.close().unwrap();
    }

    // Folder state is durable.
    let db = EmailDatabase::open(&path, DatabaseOptions::create()).unwrap();
    let inbox: Vec<EmailId> =
        db.list_folder("Inbox").unwrap().iter().map(|e| e.email_id).collect();
    assert_eq!(inbox, vec![ids[0], ids[2]]);
    let important: Vec<EmailId> =
        db.list_folder("Important").unwrap().iter().map(|e| e.email_id).collect();
    assert_eq!(important, vec![ids[1]]);
}

#[test]
fn folder_errors() {
    let (_dir, db) = open_temp(DatabaseOptions::create());
    db.create_folder("Inbox").unwrap();
    assert!(db.create_folder("Inbox").is_err());
    assert!(db.list_folder("Ghost").is_err());

    let id = db.import_eml(eml(0), None).unwrap();
    // Moving an email that is not in the source folder fails.
    db.create_folder("Other").unwrap();
    assert!(db.move_email(id, "Inbox", "Other").is_err());
}

#[test]
fn list_folder_envelopes_carry_cached_headers() {
    let (_dir, db) = open_temp(DatabaseOptions::create());
    db.create_folder("Inbox").unwrap();
    let id = db.import_eml(eml(7), None).unwrap();
    db.add_to_folder(id, "Inbox").unwrap();

    let envelopes = db.list_folder("Inbox").unwrap();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].subject, "message number 7");
    assert_eq!(envelopes[0].message_id, "msg-7@example.com");
    assert_eq!(envelopes[0].size as usize, eml(7).len());
}

#[test]
fn search_simple_and_advanced() {
    let (_dir, db) = open_temp(DatabaseOptions::create());
    for n in 0..5 {
        db.import_eml(eml(n), None).unwrap();
    }

    // Simple form: tokens AND together.
    let hits = db.search("message number").unwrap();
    assert_eq!(hits.len(), 5, "every message matches both tokens");
    // Subject matches outrank body-only matches.
    assert!(hits[0].matched_fields.contains(&"subject".to_owned()));

    // A token unique to one body.
    let hits = db.search("ticket-3").unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].subject, "message number 3");

    // Advanced form.
    let hits = db.search("subject:number AND NOT ticket-2").unwrap();
    assert_eq!(hits.len(), 4);
    assert!(hits.iter().all(|h| h.subject != "message number 2"));

    let none = db.search("absent-term-xyzzy").unwrap();
    assert!(none.is_empty());
}

#[test]
fn delete_email_removes_every_trace() {
    let (_dir, db) = open_temp(DatabaseOptions::create());
    db.create_folder("Inbox").unwrap();
    let keep = db.import_eml(eml(1), None).unwrap();
    let gone = db.import_eml(eml(2), None).unwrap();
    db.add_to_folder(keep, "Inbox").unwrap();
    db.add_to_folder(gone, "Inbox").unwrap();

    db.delete_email(gone).unwrap();

    assert_eq!(db.stats().total_emails, 1);
    let inbox: Vec<EmailId> =
        db.list_folder("Inbox").unwrap().iter().map(|e| e.email_id).collect();
    assert_eq!(inbox, vec![keep]);
    assert!(db.get_email_by_message_id("<msg-2@example.com>").is_err());
    assert!(db.search("ticket-2").unwrap().is_empty());
    // The surviving email is untouched.
    assert_eq!(db.get_email(keep).unwrap().raw, eml(1));
}

#[test]
fn deleted_emails_stay_deleted_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mail.emdb");
    {
        let db = EmailDatabase::open(&path, DatabaseOptions::create()).unwrap();
        let a = db.import_eml(eml(1), None).unwrap();
        let _b = db.import_eml(eml(2), None).unwrap();
        db.delete_email(a).unwrap();
        db.close().unwrap();
    }
    let db = EmailDatabase::open(&path, DatabaseOptions::create()).unwrap();
    assert_eq!(db.stats().total_emails, 1);
    assert!(db.get_email_by_message_id("<msg-1@example.com>").is_err());
}

#[test]
fn gzip_batches_are_smaller_than_uncompressed() {
    let repetitive: Vec<u8> = {
        let line = "The weekly status line repeats and repeats in this mailbox.\r\n";
        format!(
            "Message-ID: <big@example.com>\r\nSubject: weekly\r\n\r\n{}",
            line.repeat(5000)
        )
        .into_bytes()
    };

    let size_with = |compression: CompressionAlgorithm| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.emdb");
        let db = EmailDatabase::open(
            &path,
            DatabaseOptions { compression_default: compression, ..DatabaseOptions::create() },
        )
        .unwrap();
        db.import_eml(repetitive.clone(), None).unwrap();
        db.flush().unwrap();
        db.close().unwrap();
        std::fs::metadata(&path).unwrap().len()
    };

    let plain = size_with(CompressionAlgorithm::None);
    let gzip = size_with(CompressionAlgorithm::Gzip);
    assert!(
        (gzip as f64) < plain as f64 * 0.8,
        "gzip {gzip} should be well under plain {plain}"
    );
}

#[test]
fn encrypted_database_requires_the_right_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mail.emdb");
    let master = [0x5A; 32];
    let id;
    {
        let db = EmailDatabase::open(
            &path,
            DatabaseOptions {
                master_key: Some(master),
                encryption_default: EncryptionAlgorithm::Aes256Gcm,
                ..DatabaseOptions::create()
            },
        )
        .unwrap();
        id = db.import_eml(eml(0), None).unwrap();
        db.close().unwrap();
    }

    // Wrong key: the ciphertext never decrypts into garbage.
    {
        let db = EmailDatabase::open(
            &path,
            DatabaseOptions {
                master_key: Some([0x13; 32]),
                encryption_default: EncryptionAlgorithm::Aes256Gcm,
                ..DatabaseOptions::create()
            },
        )
        .unwrap();
        assert!(db.get_email(id).is_err());
    }

    // Right key: byte-identical round-trip.
    let db = EmailDatabase::open(
        &path,
        DatabaseOptions {
            master_key: Some(master),
            encryption_default: EncryptionAlgorithm::Aes256Gcm,
            ..DatabaseOptions::create()
        },
    )
    .unwrap();
    assert_eq!(db.get_email(id).unwrap().raw, eml(0));
}

#[test]
fn hash_chain_verifies_and_grows() {
    let (_dir, db) = open_temp(DatabaseOptions {
        hash_chain: true,
        ..DatabaseOptions::create()
    });
    db.create_folder("Inbox").unwrap();
    let id = db.import_eml(eml(0), None).unwrap();
    db.add_to_folder(id, "Inbox").unwrap();
    db.flush().unwrap();

    let result = db.verify_hash_chain(None).unwrap();
    assert!(result.ok, "{result:?}");
    assert!(result.checked >= 3, "folder blocks and the batch are chained");
}

#[test]
fn compaction_preserves_the_observable_corpus() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mail.emdb");
    let mut options = DatabaseOptions::create();
    // Reclaim immediately so the test sees space come back.
    options.maintenance.min_age_hours_for_deletion = 0;

    let mut db = EmailDatabase::open(&path, options.clone()).unwrap();
    db.create_folder("Inbox").unwrap();
    let ids: Vec<EmailId> = (0..8).map(|n| db.import_eml(eml(n), None).unwrap()).collect();
    // Every add supersedes folder blocks: plenty of garbage to drop.
    for id in &ids {
        db.add_to_folder(*id, "Inbox").unwrap();
    }
    db.flush().unwrap();

    let before = db.stats();
    assert!(before.superseded_blocks > 0);

    let outcome = db.compact(&CancelToken::new()).unwrap();
    assert!(outcome.blocks_dropped > 0);
    assert!(outcome.backup.exists());

    // The observable mapping message-id → EML is unchanged.
    let after = db.stats();
    assert_eq!(after.total_emails, 8);
    for (n, id) in ids.iter().enumerate() {
        assert_eq!(db.get_email(*id).unwrap().raw, eml(n));
        assert_eq!(
            db.get_email_by_message_id(&format!("<msg-{n}@example.com>")).unwrap().raw,
            eml(n)
        );
    }
    let inbox: Vec<EmailId> =
        db.list_folder("Inbox").unwrap().iter().map(|e| e.email_id).collect();
    assert_eq!(inbox, ids);

    // And it survives a reopen of the compacted file.
    db.close().unwrap();
    let db = EmailDatabase::open(&path, options).unwrap();
    assert_eq!(db.stats().total_emails, 8);
}

#[test]
fn corruption_in_one_batch_spares_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mail.emdb");
    let ids: Vec<EmailId>;
    {
        let db = EmailDatabase::open(
            &path,
            DatabaseOptions {
                // One batch per email so corruption stays contained.
                target_block_size: TargetBlockSize::Fixed(1),
                ..DatabaseOptions::create()
            },
        )
        .unwrap();
        ids = (0..6).map(|n| db.import_eml(eml(n), None).unwrap()).collect();
        db.close().unwrap();
    }
    assert_eq!(ids.iter().map(|i| i.batch_id).collect::<std::collections::HashSet<_>>().len(), 6);

    // Scribble over a byte near the middle of the file.
    let mut bytes = std::fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let db = EmailDatabase::open(&path, DatabaseOptions::create()).unwrap();
    let readable = ids.iter().filter(|id| db.get_email(**id).is_ok()).count();
    assert!(readable >= 5, "one corrupt byte costs at most one batch, got {readable}");
}

#[test]
fn bulk_import_reports_progress_and_errors() {
    let (_dir, db) = open_temp(DatabaseOptions::create());
    let messages = vec![
        ("good-1.eml".to_owned(), eml(1)),
        ("empty.eml".to_owned(), Vec::new()),
        ("good-2.eml".to_owned(), eml(2)),
    ];
    let mut seen = Vec::new();
    let mut progress = |done: usize, total: usize| seen.push((done, total));
    let result = db
        .import_eml_batch(messages, Some(&mut progress), &CancelToken::new())
        .unwrap();
    assert_eq!(result.success_count, 2);
    assert_eq!(result.error_count, 1);
    assert_eq!(result.errors[0].0, "empty.eml");
    assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
}

#[test]
fn cancelled_bulk_import_stops() {
    let (_dir, db) = open_temp(DatabaseOptions::create());
    let cancel = CancelToken::new();
    cancel.cancel();
    let messages = vec![("a.eml".to_owned(), eml(1))];
    assert!(matches!(
        db.import_eml_batch(messages, None, &cancel),
        Err(emdb_engine::EngineError::Cancelled)
    ));
}

#[test]
fn version_and_compatibility_report() {
    let (_dir, db) = open_temp(DatabaseOptions::create());
    assert_eq!(db.version(), DatabaseVersion::CURRENT);
    assert_eq!(db.compatibility(), VersionCompatibility::Identical);

    let plan = db.plan_migration(DatabaseVersion::new(2, 0, 0));
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].from_major, 1);
}

#[test]
fn read_only_mode_rejects_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mail.emdb");
    {
        let db = EmailDatabase::open(&path, DatabaseOptions::create()).unwrap();
        db.import_eml(eml(0), None).unwrap();
        db.close().unwrap();
    }
    let db = EmailDatabase::open(
        &path,
        DatabaseOptions { read_only: true, ..Default::default() },
    )
    .unwrap();
    assert!(db.import_eml(eml(1), None).is_err());
    assert!(db.create_folder("Inbox").is_err());
    assert_eq!(db.stats().total_emails, 1);
}

#[test]
fn txlog_records_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mail.emdb");
    {
        let db = EmailDatabase::open(&path, DatabaseOptions::create()).unwrap();
        db.import_eml(eml(0), None).unwrap();
        db.close().unwrap();
    }
    let log = std::fs::read_to_string(format!("{}.txlog", path.display())).unwrap();
    assert!(log.contains("STARTUP"));
    assert!(log.contains("IMPORT"));
    assert!(log.contains("SHUTDOWN"));
    assert!(log.lines().all(|l| !l.is_empty()));
}
