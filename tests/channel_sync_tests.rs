mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{frame_at, ScriptedConnection};
use trackplay::core::{ChannelPayload, Frame, RetrievalError};
use trackplay::engine::{
    ArrivalOrderMerger, ChannelSynchronizer, FrameMerger, MergeOutcome, StopSignal,
};
use trackplay::observability::PlaybackMetrics;
use trackplay::source::StreamRead;

const POLL: Duration = Duration::from_millis(500);

async fn collect(merger: &mut dyn FrameMerger) -> Vec<f64> {
    let mut starts = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), merger.next_frame())
            .await
            .expect("merger stalled")
            .unwrap();
        match next {
            MergeOutcome::Frame(frame) => starts.push(frame.start().unwrap()),
            MergeOutcome::Ended => return starts,
        }
    }
}

/// The returned signal must outlive the merge: readers treat a dropped
/// signal as a stop.
async fn synchronizer(
    sides: Vec<ScriptedConnection>,
    probe: Duration,
    metrics: Arc<PlaybackMetrics>,
) -> (ChannelSynchronizer, StopSignal) {
    let signal = StopSignal::new();
    let mut connections = Vec::new();
    for (idx, side) in sides.into_iter().enumerate() {
        connections.push(side.subscribed(&format!("side{}", idx)).await);
    }
    let sync = ChannelSynchronizer::spawn(
        connections,
        POLL,
        probe,
        signal.listener(signal.generation()),
        metrics,
    );
    (sync, signal)
}

#[tokio::test]
async fn test_two_sides_merge_in_time_order() {
    let a = ScriptedConnection::frames("a", &[10.0, 11.0, 12.0], Duration::ZERO);
    let b = ScriptedConnection::frames("b", &[10.5, 11.5], Duration::ZERO);

    let (mut sync, _signal) = synchronizer(vec![a, b], Duration::from_millis(200), Arc::new(PlaybackMetrics::new())).await;
    let merged = collect(&mut sync).await;
    sync.shutdown(Duration::from_millis(100)).await;

    assert_eq!(merged, vec![10.0, 10.5, 11.0, 11.5, 12.0]);
}

#[tokio::test]
async fn test_slow_side_does_not_reorder_output() {
    // Secondary side is produced late; the primary must not overtake it.
    let a = ScriptedConnection::frames("a", &[1.0, 2.0, 3.0, 4.0], Duration::from_millis(1));
    let b = ScriptedConnection::frames("b", &[1.5, 2.5, 3.5], Duration::from_millis(15));

    let (mut sync, _signal) = synchronizer(vec![a, b], Duration::from_millis(100), Arc::new(PlaybackMetrics::new())).await;
    let merged = collect(&mut sync).await;

    assert_eq!(merged, vec![1.0, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0]);
}

#[tokio::test]
async fn test_output_never_decreases_for_any_interleaving() {
    let patterns: [(u64, u64); 5] = [(0, 0), (0, 7), (7, 0), (3, 11), (11, 3)];
    let a_starts = [0.0, 0.4, 0.8, 1.2, 1.6, 2.0];
    let b_starts = [0.1, 0.3, 0.9, 1.0, 1.9];

    for (gap_a, gap_b) in patterns {
        let metrics = Arc::new(PlaybackMetrics::new());
        let a = ScriptedConnection::frames("a", &a_starts, Duration::from_millis(gap_a));
        let b = ScriptedConnection::frames("b", &b_starts, Duration::from_millis(gap_b));

        // A short probe lets the fast side run ahead, forcing late arrivals.
        let (mut sync, _signal) = synchronizer(vec![a, b], Duration::from_millis(2), metrics.clone()).await;
        let merged = collect(&mut sync).await;

        assert!(
            merged.windows(2).all(|w| w[0] <= w[1]),
            "gaps {:?} produced {:?}",
            (gap_a, gap_b),
            merged
        );
        assert_eq!(
            merged.len() as u64 + metrics.late_dropped(),
            (a_starts.len() + b_starts.len()) as u64
        );
    }
}

#[tokio::test]
async fn test_single_producing_side_passes_through() {
    let a = ScriptedConnection::frames("a", &[5.0, 6.0, 7.0], Duration::ZERO);
    let b = ScriptedConnection::new(vec![]);

    let (mut sync, _signal) = synchronizer(vec![a, b], Duration::from_millis(20), Arc::new(PlaybackMetrics::new())).await;
    assert_eq!(collect(&mut sync).await, vec![5.0, 6.0, 7.0]);
}

#[tokio::test]
async fn test_both_sides_ended_signals_end() {
    let (mut sync, _signal) = synchronizer(
        vec![ScriptedConnection::new(vec![]), ScriptedConnection::new(vec![])],
        Duration::from_millis(20),
        Arc::new(PlaybackMetrics::new()),
    )
    .await;

    assert_eq!(sync.next_frame().await.unwrap(), MergeOutcome::Ended);
    // Stays ended.
    assert_eq!(sync.next_frame().await.unwrap(), MergeOutcome::Ended);
}

#[tokio::test]
async fn test_three_sides_merge() {
    let sides = vec![
        ScriptedConnection::frames("a", &[0.0, 3.0], Duration::ZERO),
        ScriptedConnection::frames("b", &[1.0, 4.0], Duration::ZERO),
        ScriptedConnection::frames("c", &[2.0, 5.0], Duration::ZERO),
    ];
    let (mut sync, _signal) = synchronizer(sides, Duration::from_millis(200), Arc::new(PlaybackMetrics::new())).await;
    assert_eq!(collect(&mut sync).await, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
}

#[tokio::test]
async fn test_side_failure_is_propagated() {
    let a = ScriptedConnection::new(vec![
        (Duration::ZERO, Ok(StreamRead::Frame(frame_at("a", 1.0, 1.0)))),
        (Duration::ZERO, Err(RetrievalError::communication("reset by peer"))),
    ]);
    let b = ScriptedConnection::frames("b", &[1.5], Duration::ZERO);

    let (mut sync, _signal) = synchronizer(vec![a, b], Duration::from_millis(50), Arc::new(PlaybackMetrics::new())).await;

    let mut failure = None;
    for _ in 0..4 {
        match sync.next_frame().await {
            Ok(MergeOutcome::Frame(_)) => continue,
            Ok(MergeOutcome::Ended) => break,
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    assert!(matches!(failure, Some(RetrievalError::CommunicationFailure(_))));
    sync.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_malformed_frames_are_discarded() {
    let metrics = Arc::new(PlaybackMetrics::new());
    let bad = Frame::single(ChannelPayload::new("a", f64::NAN, 1.0, vec![]));
    let a = ScriptedConnection::new(vec![
        (Duration::ZERO, Ok(StreamRead::Frame(frame_at("a", 1.0, 1.0)))),
        (Duration::ZERO, Ok(StreamRead::Frame(bad))),
        (Duration::ZERO, Ok(StreamRead::Frame(frame_at("a", 2.0, 1.0)))),
    ]);

    let (mut sync, _signal) = synchronizer(vec![a, ScriptedConnection::new(vec![])], Duration::from_millis(20), metrics.clone()).await;
    assert_eq!(collect(&mut sync).await, vec![1.0, 2.0]);
    assert_eq!(metrics.malformed_discarded(), 1);
}

#[tokio::test]
async fn test_stop_wakes_waiting_synchronizer() {
    let sides = vec![
        ScriptedConnection::frames("a", &[1.0], Duration::from_secs(30)),
        ScriptedConnection::frames("b", &[1.5], Duration::from_secs(30)),
    ];
    let (mut sync, signal) =
        synchronizer(sides, Duration::from_millis(20), Arc::new(PlaybackMetrics::new())).await;

    let waiting = tokio::spawn(async move {
        let next = sync.next_frame().await;
        sync.shutdown(Duration::from_millis(100)).await;
        next
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    signal.advance();

    let next = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("synchronizer ignored stop")
        .unwrap();
    assert_eq!(next.unwrap(), MergeOutcome::Ended);
}

#[tokio::test]
async fn test_stop_signal_ends_readers() {
    let signal = StopSignal::new();
    let slow = ScriptedConnection::frames("a", &[1.0, 2.0], Duration::from_secs(30));
    let connection = slow.subscribed("a").await;

    let mut merger = ArrivalOrderMerger::spawn(
        connection,
        POLL,
        signal.listener(signal.generation()),
        Arc::new(PlaybackMetrics::new()),
    );

    signal.advance();
    let next = tokio::time::timeout(Duration::from_secs(1), merger.next_frame())
        .await
        .expect("reader ignored stop");
    assert_eq!(next.unwrap(), MergeOutcome::Ended);
    merger.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_arrival_order_is_kept() {
    let signal = StopSignal::new();
    let connection = ScriptedConnection::frames("a", &[3.0, 1.0, 2.0], Duration::ZERO)
        .subscribed("a")
        .await;
    let mut merger = ArrivalOrderMerger::spawn(
        connection,
        POLL,
        signal.listener(signal.generation()),
        Arc::new(PlaybackMetrics::new()),
    );

    assert_eq!(collect(&mut merger).await, vec![3.0, 1.0, 2.0]);
}
