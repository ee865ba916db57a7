// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end channel behaviour: create/attach, the read-write protocol,
//! overwrite detection, reclamation, and recovery.

use labhub::config::RuntimeTuning;
use labhub::hub::layout;
use labhub::platform::{channel_segment_name, ShmSegment};
use labhub::{
    AttachConfig, ChannelConfig, Consumer, HubError, Producer, ReadValidity, SchemaDescriptor,
    TypeTag,
};
use std::sync::Arc;

fn unique_channel(tag: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("it_{tag}_{ts}")
}

/// Tuning that treats any held reader as immediately evictable, so overrun
/// paths run in test time instead of wall-clock seconds.
fn impatient_tuning() -> Arc<RuntimeTuning> {
    let mut t = RuntimeTuning::default();
    t.writer_patience_ns = 100_000; // 0.1 ms
    t.reader_timeout_ns = 1;
    Arc::new(t)
}

#[test]
fn happy_path_single_record() {
    let channel = unique_channel("t1");
    let mut producer = Producer::create(&channel, &ChannelConfig::new(4, 16)).expect("create");

    let payload: Vec<u8> = (1..=16).collect();
    let mut slot = producer.acquire_write_slot(-1).expect("acquire write");
    slot.payload_mut().copy_from_slice(&payload);
    assert_eq!(slot.commit().expect("commit"), 0);

    let consumer = Consumer::attach(&channel, &AttachConfig::new(producer.secret(), 16))
        .expect("attach");

    let mut seen = 0;
    for read in consumer.iter_slots() {
        assert_eq!(read.slot_id(), 0);
        assert_eq!(read.payload(), &payload[..]);
        assert!(read.validate());
        assert_eq!(read.release(), ReadValidity::Valid);
        seen += 1;
    }
    assert_eq!(seen, 1);
}

#[test]
fn overwrite_detection_invalidates_held_read() {
    let channel = unique_channel("overwrite");
    let tuning = impatient_tuning();
    let mut producer =
        Producer::create_with_tuning(&channel, &ChannelConfig::new(2, 8), Arc::clone(&tuning))
            .expect("create");

    for i in 0u8..4 {
        let mut slot = producer.acquire_write_slot(-1).expect("acquire");
        slot.payload_mut().fill(i);
        slot.commit().expect("commit");
    }

    let mut consumer = Consumer::attach_with_tuning(
        &channel,
        &AttachConfig::new(producer.secret(), 8),
        Arc::clone(&tuning),
    )
    .expect("attach");

    // Newest committed slot: id 3, physical slot 1.
    let read = consumer.acquire_slot(3).expect("admit id 3");

    // The producer laps the ring; id 5 lands in physical slot 1. The held
    // reader's heartbeat is already "stale" under the impatient tuning, so
    // the writer evicts rather than waiting.
    for i in 4u8..6 {
        let mut slot = producer.acquire_write_slot(2_000).expect("acquire past reader");
        slot.payload_mut().fill(i);
        slot.commit().expect("commit");
    }

    assert_eq!(read.release(), ReadValidity::Invalidated);
    assert!(producer.metrics().overruns >= 1);

    // The consumer recovers by acquiring the latest commit.
    let read = consumer.acquire_latest(1_000).expect("acquire latest");
    assert_eq!(read.slot_id(), 5);
    assert_eq!(read.release(), ReadValidity::Valid);
}

#[test]
fn zombie_reader_is_reclaimed() {
    let channel = unique_channel("zombie");
    let tuning = impatient_tuning();
    let mut producer =
        Producer::create_with_tuning(&channel, &ChannelConfig::new(2, 8), Arc::clone(&tuning))
            .expect("create");

    {
        let mut slot = producer.acquire_write_slot(-1).expect("acquire");
        slot.payload_mut().fill(7);
        slot.commit().expect("commit");
    }

    // A consumer admits a read and then "crashes": the handle leaks (the
    // reader count stays up) and the process's heartbeat entry goes away.
    let consumer = Consumer::attach(&channel, &AttachConfig::new(producer.secret(), 8))
        .expect("attach");
    let read = consumer.acquire_slot(0).expect("admit");
    std::mem::forget(read);
    drop(consumer);

    let overruns_before = producer.metrics().overruns;

    // Wrap back onto physical slot 0; the writer must evict the orphaned
    // count after its patience runs out.
    for i in 0u8..2 {
        let mut slot = producer.acquire_write_slot(2_000).expect("acquire past zombie");
        slot.payload_mut().fill(i);
        slot.commit().expect("commit");
    }

    assert!(producer.metrics().overruns > overruns_before);
}

#[test]
fn schema_mismatch_is_rejected() {
    let channel = unique_channel("schema");
    let stored = SchemaDescriptor::new(16, 8)
        .with_field("timestamp", 0, 8, TypeTag::U64)
        .with_field("value", 8, 8, TypeTag::F64);
    let cfg = ChannelConfig::new(4, 16).with_schemas(Some(stored.clone()), None);
    let producer = Producer::create(&channel, &cfg).expect("create");

    // Same layout, different field name: different hash, hard reject.
    let expected = SchemaDescriptor::new(16, 8)
        .with_field("timestamp", 0, 8, TypeTag::U64)
        .with_field("reading", 8, 8, TypeTag::F64);
    let attach = AttachConfig::new(producer.secret(), 16).with_schemas(Some(expected), None);
    let err = Consumer::attach(&channel, &attach).expect_err("must reject");
    assert_eq!(err.code(), 4);

    // No schema at all is also a mismatch against a typed channel.
    let attach = AttachConfig::new(producer.secret(), 16);
    let err = Consumer::attach(&channel, &attach).expect_err("must reject untyped");
    assert_eq!(err.code(), 4);

    // The right schema still attaches: the failures left the header intact.
    let attach = AttachConfig::new(producer.secret(), 16).with_schemas(Some(stored), None);
    Consumer::attach(&channel, &attach).expect("attach with matching schema");
}

#[test]
fn auth_failure_allocates_nothing() {
    let channel = unique_channel("auth");
    let producer = Producer::create(&channel, &ChannelConfig::new(2, 8)).expect("create");

    let err = Consumer::attach(&channel, &AttachConfig::new(producer.secret() ^ 1, 8))
        .expect_err("wrong secret");
    assert_eq!(err.code(), 3);

    // The failed attach must not have burned a heartbeat entry: the full
    // pool of 8 is still available.
    let attach = AttachConfig::new(producer.secret(), 8);
    let consumers: Vec<Consumer> = (0..8)
        .map(|i| Consumer::attach(&channel, &attach).unwrap_or_else(|e| {
            panic!("attach {i} failed: {e}")
        }))
        .collect();
    drop(consumers);
}

#[test]
fn heartbeat_pool_exhaustion_is_code_6() {
    let channel = unique_channel("hbpool");
    let producer = Producer::create(&channel, &ChannelConfig::new(2, 8)).expect("create");
    let attach = AttachConfig::new(producer.secret(), 8);

    let _consumers: Vec<Consumer> = (0..8)
        .map(|i| {
            Consumer::attach(&channel, &attach)
                .unwrap_or_else(|e| panic!("attach {i} failed: {e}"))
        })
        .collect();

    let err = Consumer::attach(&channel, &attach).expect_err("ninth consumer");
    assert_eq!(err.code(), 6);
    assert!(matches!(err, HubError::HeartbeatPoolExhausted));
}

#[test]
fn corrupted_payload_fails_validation_and_scan() {
    let channel = unique_channel("corrupt");
    let mut producer = Producer::create(&channel, &ChannelConfig::new(8, 16)).expect("create");

    for i in 0u8..6 {
        let mut slot = producer.acquire_write_slot(-1).expect("acquire");
        slot.payload_mut().fill(i);
        slot.commit().expect("commit");
    }

    // An external process flips one byte of slot id 5's payload.
    {
        let seg_name = channel_segment_name(&channel);
        let total = layout::total_segment_size(0, 16, 8);
        let seg = ShmSegment::open(&seg_name, total as usize).expect("open raw");
        let offset = layout::slot_payload_offset(0, 16, 5) as usize + fastrand::usize(..16);
        // SAFETY: offset is within the mapping; this test plays the role of
        // the corrupting process.
        unsafe {
            *seg.as_ptr().add(offset) ^= 0xff;
        }
    }

    let consumer = Consumer::attach(&channel, &AttachConfig::new(producer.secret(), 16))
        .expect("attach");

    // Admission still succeeds; validation is what catches the damage.
    let read = consumer.acquire_slot(5).expect("admit corrupted slot");
    assert!(!read.validate());
    assert_eq!(read.release(), ReadValidity::Invalidated);
    assert!(consumer.metrics().integrity_failures >= 1);

    let report = labhub::validate_integrity(&channel).expect("scan");
    assert_eq!(report.checksum_mismatches, vec![5]);
    assert!(!report.is_clean());

    // Untouched slots still read clean.
    let read = consumer.acquire_slot(4).expect("admit clean slot");
    assert_eq!(read.release(), ReadValidity::Valid);
}

#[test]
fn single_slot_channel_overruns_held_reader() {
    let channel = unique_channel("n1");
    let tuning = impatient_tuning();
    let mut producer =
        Producer::create_with_tuning(&channel, &ChannelConfig::new(1, 4), Arc::clone(&tuning))
            .expect("create");

    {
        let mut slot = producer.acquire_write_slot(-1).expect("acquire");
        slot.payload_mut().fill(1);
        slot.commit().expect("commit");
    }

    let consumer = Consumer::attach(&channel, &AttachConfig::new(producer.secret(), 4))
        .expect("attach");
    let read = consumer.acquire_slot(0).expect("admit");

    // With N=1 every write lands on the held slot; the writer gets through
    // after its patience window.
    let mut slot = producer.acquire_write_slot(2_000).expect("acquire despite reader");
    slot.payload_mut().fill(2);
    slot.commit().expect("commit");

    assert!(producer.metrics().overruns >= 1);
    assert_eq!(read.release(), ReadValidity::Invalidated);
}

#[test]
fn one_byte_slots_work() {
    let channel = unique_channel("tiny");
    let mut producer = Producer::create(&channel, &ChannelConfig::new(4, 1)).expect("create");

    for b in [0x11u8, 0x22, 0x33] {
        let mut slot = producer.acquire_write_slot(-1).expect("acquire");
        slot.payload_mut()[0] = b;
        slot.commit().expect("commit");
    }

    let mut consumer = Consumer::attach(&channel, &AttachConfig::new(producer.secret(), 1))
        .expect("attach");
    let read = consumer.acquire_latest(1_000).expect("latest");
    assert_eq!(read.slot_id(), 2);
    assert_eq!(read.payload(), &[0x33]);
    assert_eq!(read.release(), ReadValidity::Valid);
}

#[test]
fn acquire_latest_times_out_on_quiet_channel() {
    let channel = unique_channel("timeout");
    let producer = Producer::create(&channel, &ChannelConfig::new(2, 8)).expect("create");

    let mut consumer = Consumer::attach(&channel, &AttachConfig::new(producer.secret(), 8))
        .expect("attach");

    // Try-once on an empty channel
    let err = consumer.acquire_latest(0).expect_err("nothing to read");
    assert_eq!(err.code(), 7);

    // Bounded wait
    let start = std::time::Instant::now();
    let err = consumer.acquire_latest(50).expect_err("still nothing");
    assert_eq!(err.code(), 7);
    assert!(start.elapsed() >= std::time::Duration::from_millis(45));
    assert!(consumer.metrics().acquire_failures >= 2);
}

#[test]
fn acquire_latest_sees_only_newer_commits() {
    let channel = unique_channel("latest");
    let mut producer = Producer::create(&channel, &ChannelConfig::new(4, 8)).expect("create");

    {
        let mut slot = producer.acquire_write_slot(-1).expect("acquire");
        slot.payload_mut().fill(1);
        slot.commit().expect("commit");
    }

    // Attaching after the first commit: that record is history, not news.
    let mut consumer = Consumer::attach(&channel, &AttachConfig::new(producer.secret(), 8))
        .expect("attach");
    assert_eq!(consumer.acquire_latest(0).expect_err("no news").code(), 7);

    {
        let mut slot = producer.acquire_write_slot(-1).expect("acquire");
        slot.payload_mut().fill(2);
        slot.commit().expect("commit");
    }

    let read = consumer.acquire_latest(1_000).expect("news");
    assert_eq!(read.slot_id(), 1);
    assert_eq!(read.release(), ReadValidity::Valid);

    // Same id never delivered twice.
    assert_eq!(consumer.acquire_latest(0).expect_err("consumed").code(), 7);
}

#[test]
fn iterator_walks_window_newest_first() {
    let channel = unique_channel("iter");
    let mut producer = Producer::create(&channel, &ChannelConfig::new(4, 8)).expect("create");

    for i in 0u8..6 {
        let mut slot = producer.acquire_write_slot(-1).expect("acquire");
        slot.payload_mut().fill(i);
        slot.commit().expect("commit");
    }

    let consumer = Consumer::attach(&channel, &AttachConfig::new(producer.secret(), 8))
        .expect("attach");

    let ids: Vec<u64> = consumer
        .iter_slots()
        .map(|read| {
            let id = read.slot_id();
            assert_eq!(read.payload()[0], id as u8);
            assert_eq!(read.release(), ReadValidity::Valid);
            id
        })
        .collect();
    assert_eq!(ids, vec![5, 4, 3, 2]);
}

#[test]
fn flexible_zone_checksum_roundtrip() {
    let channel = unique_channel("flex");
    let cfg = ChannelConfig::new(2, 8).with_flexible_zone(64);
    let mut producer = Producer::create(&channel, &cfg).expect("create");

    producer.flex_zone_mut()[..4].copy_from_slice(b"ping");
    producer.update_flex_zone_checksum().expect("update");

    let attach = AttachConfig::new(producer.secret(), 8).with_flexible_zone(64);
    let consumer = Consumer::attach(&channel, &attach).expect("attach");

    assert_eq!(&consumer.flex_zone()[..4], b"ping");
    consumer.verify_flex_zone_checksum().expect("verify");

    // Producer mutates without refreshing the checksum: verify must fail.
    producer.flex_zone_mut()[0] = b'x';
    let err = consumer.verify_flex_zone_checksum().expect_err("stale checksum");
    assert_eq!(err.code(), 9);

    producer.update_flex_zone_checksum().expect("refresh");
    consumer.verify_flex_zone_checksum().expect("verify again");
}

#[test]
fn config_mismatch_is_code_5() {
    let channel = unique_channel("cfgmm");
    let producer = Producer::create(&channel, &ChannelConfig::new(4, 16)).expect("create");

    let err = Consumer::attach(&channel, &AttachConfig::new(producer.secret(), 32))
        .expect_err("wrong slot size");
    assert_eq!(err.code(), 5);

    let attach = AttachConfig::new(producer.secret(), 16).with_slot_count(8);
    let err = Consumer::attach(&channel, &attach).expect_err("wrong slot count");
    assert_eq!(err.code(), 5);
}

#[test]
fn attach_to_missing_channel_is_code_11() {
    let err = Consumer::attach(
        &unique_channel("missing"),
        &AttachConfig::new(1, 8),
    )
    .expect_err("no such channel");
    assert_eq!(err.code(), 11);
}

#[test]
fn force_reset_is_idempotent_when_quiescent() {
    let channel = unique_channel("reset");
    let mut producer = Producer::create(&channel, &ChannelConfig::new(2, 8)).expect("create");

    {
        let mut slot = producer.acquire_write_slot(-1).expect("acquire");
        slot.payload_mut().fill(9);
        slot.commit().expect("commit");
    }
    let secret = producer.secret();
    let gen_before = producer.metrics().generation;

    let first = labhub::force_reset(&channel).expect("reset");
    assert_eq!(first.aborted_writes, 0);
    assert_eq!(first.cleared_readers, 0);

    let second = labhub::force_reset(&channel).expect("reset again");
    assert_eq!(second.aborted_writes, 0);
    assert_eq!(second.cleared_readers, 0);

    // Generation moved, the secret and data did not.
    assert_eq!(producer.metrics().generation, gen_before + 2);
    assert_eq!(producer.secret(), secret);

    let consumer = Consumer::attach(&channel, &AttachConfig::new(secret, 8)).expect("attach");
    let read = consumer.acquire_slot(0).expect("admit");
    assert_eq!(read.release(), ReadValidity::Valid);
}

#[test]
fn diagnostic_view_requires_token_and_stays_invisible() {
    let channel = unique_channel("diag");
    let mut producer = Producer::create(&channel, &ChannelConfig::new(2, 8)).expect("create");

    {
        let mut slot = producer.acquire_write_slot(-1).expect("acquire");
        slot.payload_mut().fill(0x5a);
        slot.commit().expect("commit");
    }

    let token = [0x42u8; 32];
    std::env::set_var(labhub::recovery::ADMIN_TOKEN_ENV, "42".repeat(32));

    let wrong = [0u8; 32];
    assert_eq!(
        labhub::open_for_diagnostic(&channel, &wrong)
            .expect_err("wrong token")
            .code(),
        3
    );

    let view = labhub::open_for_diagnostic(&channel, &token).expect("open view");
    assert_eq!(view.geometry(), (2, 8, 0));
    assert_eq!(view.metrics().writes, 1);
    assert_eq!(view.peek_payload(0), vec![0x5a; 8]);
    assert_eq!(view.slot_state(0).slot_id, 0);
    assert_eq!(view.slot_state(0).readers, 0, "view must not admit readers");
    assert!(view.consumer_heartbeats().is_empty(), "view must not register heartbeats");

    std::env::remove_var(labhub::recovery::ADMIN_TOKEN_ENV);
}

#[test]
fn stale_segment_is_reclaimed_on_create() {
    let channel = unique_channel("reclaim");
    let seg_name = channel_segment_name(&channel);

    // A leftover segment with no valid header squats the name.
    {
        let _seg = ShmSegment::create(&seg_name, 4096).expect("squat");
    }
    assert!(ShmSegment::exists(&seg_name));

    // Create recognises the squatter as unowned and replaces it.
    let producer = Producer::create(&channel, &ChannelConfig::new(2, 8)).expect("reclaim");
    assert_eq!(producer.slot_count(), 2);

    drop(producer);
    assert!(!ShmSegment::exists(&seg_name));
}
