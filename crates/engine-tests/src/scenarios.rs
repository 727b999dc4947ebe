#[cfg(test)]
mod tests {
    use crate::utils::{
        Harness, PROCESS, RAW, SOURCE_TABLE, STAGING, TARGET, order, runtime_config, t,
    };
    use chrono::TimeDelta;
    use chrono_tz::Tz;
    use connectors::{error::SourceError, memory::MemorySource};
    use engine_config::Settings;
    use engine_core::{journal::SanitizePolicy, slicer::SplitPolicy};
    use engine_processing::error::PublishStep;
    use engine_runtime::{
        RunBounds, RunError, RunOutcome, RuntimeConfig,
        execution::orchestrator::UNPUBLISHED_PARTITIONS,
    };
    use model::{
        journal::{CloseReason, RunStatus},
        partition::PartitionKey,
        window::TimeWindow,
    };
    use serde_json::json;
    use std::io::Write;
    use tracing_test::traced_test;

    fn hour() -> RunBounds {
        RunBounds {
            since: Some(t(0)),
            until: Some(t(60)),
        }
    }

    // Four quarter-hour slices over one hour, all ok, watermark at the end.
    #[traced_test]
    #[tokio::test]
    async fn one_hour_in_quarter_hour_slices() {
        let h = Harness::with_orders(vec![
            order(1, "new", t(1)),
            order(2, "new", t(20)),
            order(3, "new", t(40)),
            order(4, "new", t(59)),
            order(5, "late", t(61)),
        ])
        .await;

        let report = h.orchestrator(runtime_config()).run(hour()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(report.is_success());
        assert_eq!(report.slices_planned, 4);
        assert_eq!(report.slices_done, 4);
        assert_eq!(report.watermark, Some(t(60)));
        assert_eq!(report.metrics.rows_written, 4);

        let records = h.store.records().await;
        let main: Vec<_> = records.iter().filter(|r| r.process_name == PROCESS).collect();
        assert_eq!(main.len(), 4);
        assert!(main.iter().all(|r| r.status == RunStatus::Ok));
        let windows: Vec<TimeWindow> = main.iter().filter_map(|r| r.window()).collect();
        for (i, w) in windows.iter().enumerate() {
            let i = i as i64;
            assert_eq!(*w, TimeWindow::new(t(15 * i), t(15 * (i + 1))).unwrap());
        }

        assert_eq!(report.published.len(), 1);
        assert_eq!(
            h.published().await,
            vec![
                (1, "new".to_string()),
                (2, "new".to_string()),
                (3, "new".to_string()),
                (4, "new".to_string()),
            ]
        );
        assert!(h.sink.rows(STAGING).await.is_empty());
    }

    // A running record that stopped heartbeating is reclaimed, and the
    // watermark stays where it was.
    #[traced_test]
    #[tokio::test]
    async fn stale_running_record_is_reclaimed() {
        let h = Harness::with_orders(vec![]).await;
        h.journal.ensure().await.unwrap();
        let stuck = TimeWindow::new(t(0), t(15)).unwrap();
        h.journal.mark_running(&stuck, None, None).await.unwrap();
        h.clock.advance(TimeDelta::minutes(10));

        let report = h
            .journal
            .sanitize_stale(&SanitizePolicy {
                heartbeat_timeout: TimeDelta::minutes(1),
                ..SanitizePolicy::default()
            })
            .await;
        assert_eq!(report.heartbeat_timeout.len(), 1);

        let record = &h.store.records().await[0];
        assert_eq!(record.status, RunStatus::Error);
        assert_eq!(record.details.reason, Some(CloseReason::HeartbeatTimeout));
        assert_eq!(h.journal.get_watermark().await.unwrap(), None);
    }

    // The next run reclaims what a crashed run left behind and proceeds.
    #[traced_test]
    #[tokio::test]
    async fn run_after_a_crash_resumes() {
        let h = Harness::with_orders(vec![order(1, "new", t(5)), order(2, "new", t(25))]).await;
        h.journal.ensure().await.unwrap();
        let first = TimeWindow::new(t(0), t(15)).unwrap();
        h.journal.mark_running(&first, Some("dead-host"), Some(1)).await.unwrap();
        h.clock.advance(TimeDelta::hours(1));

        let report = h
            .orchestrator(runtime_config())
            .run(RunBounds {
                since: None,
                until: Some(t(30)),
            })
            .await
            .unwrap();
        assert_eq!(report.sanitized.heartbeat_timeout.len(), 1);
        assert_eq!(report.slices_done, 2);
        assert_eq!(report.watermark, Some(t(30)));
        assert_eq!(h.published().await.len(), 2);
    }

    // A run that died inside a window clipped to its own `until` leaves a
    // running record the next, wider window cannot reuse. The lock holder
    // demotes it and carries on.
    #[traced_test]
    #[tokio::test]
    async fn crashed_clipped_window_is_superseded_by_the_next_run() {
        let h = Harness::with_orders(vec![order(1, "new", t(47)), order(2, "new", t(55))]).await;
        h.journal.ensure().await.unwrap();
        let clipped = TimeWindow::new(t(45), t(50)).unwrap();
        let stale = h
            .journal
            .mark_running(&clipped, Some("dead-host"), Some(1))
            .await
            .unwrap();
        h.clock.advance(TimeDelta::minutes(2));

        let report = h
            .orchestrator(runtime_config())
            .run(RunBounds {
                since: Some(t(45)),
                until: Some(t(60)),
            })
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.slices_done, 1);
        assert_eq!(report.watermark, Some(t(60)));

        let records = h.store.records().await;
        let old = records.iter().find(|r| r.id == stale).unwrap();
        assert_eq!(old.status, RunStatus::Error);
        assert_eq!(old.details.reason, Some(CloseReason::Conflict));
        assert_eq!(h.published().await.len(), 2);
    }

    // A five-minute window refused twice on the way down is covered exactly
    // by leaves under the source's limit.
    #[traced_test]
    #[tokio::test]
    async fn overloaded_window_is_split_into_fitting_leaves() {
        let rows = (0..10)
            .map(|i| order(i, "new", t(0) + TimeDelta::seconds(i * 30)))
            .collect();
        let h = Harness::new(
            MemorySource::new()
                .with_rows(SOURCE_TABLE, rows)
                .with_overload_above(TimeDelta::seconds(100)),
        )
        .await;
        let config = RuntimeConfig {
            step: TimeDelta::minutes(5),
            split: SplitPolicy {
                min_split: TimeDelta::seconds(60),
                max_depth: 6,
            },
            ..runtime_config()
        };

        let report = h
            .orchestrator(config)
            .run(RunBounds {
                since: Some(t(0)),
                until: Some(t(5)),
            })
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.metrics.splits, 3);
        assert_eq!(report.metrics.rows_written, 10);

        let fetched = h.source.fetched_windows().await;
        let leaves: Vec<TimeWindow> = fetched
            .into_iter()
            .filter(|w| w.duration() <= TimeDelta::seconds(100))
            .collect();
        assert_eq!(leaves.len(), 4);
        assert_eq!(leaves[0].from, t(0));
        assert_eq!(leaves[3].to, t(5));
        for pair in leaves.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
        }
        assert_eq!(h.journal.get_watermark().await.unwrap(), Some(t(5)));
    }

    // A second instance for the same process gives up without touching the
    // journal.
    #[traced_test]
    #[tokio::test]
    async fn second_instance_cannot_take_the_lock() {
        let a = Harness::with_orders(vec![order(1, "new", t(5))]).await;
        a.journal.ensure().await.unwrap();
        assert!(a.journal.try_acquire_exclusive_lock().await.unwrap());

        let b = a.peer();
        let report = b.orchestrator(runtime_config()).run(hour()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::LockNotAcquired);
        assert!(a.store.records().await.is_empty());
        assert_eq!(b.journal.state().await.unwrap(), None);
        assert!(a.sink.rows(RAW).await.is_empty());

        a.journal.release().await.unwrap();
        let report = b.orchestrator(runtime_config()).run(hour()).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
    }

    // A failing slice freezes the watermark, stops the run and is picked up
    // again by the next one.
    #[traced_test]
    #[tokio::test]
    async fn failed_slice_stops_the_run_and_is_retried_next_time() {
        let h = Harness::with_orders(vec![order(1, "new", t(5)), order(2, "new", t(20))]).await;
        h.source
            .fail_next_fetch(SourceError::Unavailable("connection refused".into()))
            .await;

        let report = h.orchestrator(runtime_config()).run(hour()).await.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.slices_done, 0);
        assert_eq!(report.failure.as_ref().map(|f| f.window.from), Some(t(0)));
        assert_eq!(report.watermark, None);
        let records = h.store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RunStatus::Error);
        assert!(h.sink.rows(TARGET).await.is_empty());

        let report = h.orchestrator(runtime_config()).run(hour()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.watermark, Some(t(60)));
        assert_eq!(h.published().await.len(), 2);
    }

    // Later versions arriving in a later run replace the published row;
    // publishing again without new raw rows leaves the target as it was.
    #[traced_test]
    #[tokio::test]
    async fn republishing_is_idempotent_and_latest_ingest_wins() {
        let h = Harness::with_orders(vec![order(1, "new", t(5)), order(2, "new", t(10))]).await;
        h.orchestrator(runtime_config())
            .run(RunBounds {
                since: None,
                until: Some(t(30)),
            })
            .await
            .unwrap();
        assert_eq!(
            h.published().await,
            vec![(1, "new".to_string()), (2, "new".to_string())]
        );

        h.source.insert(SOURCE_TABLE, vec![order(1, "paid", t(40))]).await;
        h.clock.advance(TimeDelta::minutes(1));
        h.orchestrator(runtime_config())
            .run(RunBounds {
                since: None,
                until: Some(t(45)),
            })
            .await
            .unwrap();
        let after_update = h.published().await;
        assert_eq!(
            after_update,
            vec![(1, "paid".to_string()), (2, "new".to_string())]
        );

        let publisher = h.publisher(runtime_config());
        let day = PartitionKey::for_instant(&t(0), Tz::UTC);
        assert!(publisher.publish(&[day]).await.any_replaced());
        assert!(publisher.publish(&[day]).await.any_replaced());
        assert_eq!(h.published().await, after_update);

        let report = h
            .orchestrator(runtime_config())
            .run(RunBounds {
                since: None,
                until: Some(t(45)),
            })
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::NothingToDo);
    }

    // Repeated keys inside one run keep the first fetched row.
    #[traced_test]
    #[tokio::test]
    async fn duplicates_within_a_run_are_dropped_before_the_sink() {
        let h = Harness::with_orders(vec![
            order(1, "new", t(5)),
            order(1, "paid", t(20)),
            order(2, "new", t(25)),
        ])
        .await;
        let report = h.orchestrator(runtime_config()).run(hour()).await.unwrap();
        assert_eq!(report.metrics.duplicates_dropped, 1);
        assert_eq!(h.sink.rows(RAW).await.len(), 2);
        assert_eq!(
            h.published().await,
            vec![(1, "new".to_string()), (2, "new".to_string())]
        );
    }

    // Gated periodic publishes plus the final backfill reach every partition.
    #[traced_test]
    #[tokio::test]
    async fn gated_publishes_are_backstopped_at_the_end() {
        let day = 24 * 60;
        let h = Harness::with_orders(vec![
            order(1, "new", t(10)),
            order(2, "new", t(day + 10)),
            order(3, "new", t(day + 20)),
        ])
        .await;
        h.clock.set(t(3 * day));
        let mut config = runtime_config();
        config.step = TimeDelta::hours(12);
        config.publish.every_slices = 1;
        config.publish.min_new_rows = 2;

        let report = h
            .orchestrator(config)
            .run(RunBounds {
                since: Some(t(0)),
                until: Some(t(2 * day)),
            })
            .await
            .unwrap();
        assert_eq!(report.slices_done, 4);
        assert_eq!(h.published().await.len(), 3);
        let replaced: Vec<String> = report.published.iter().map(|p| p.partition_id()).collect();
        assert!(replaced.contains(&"20250101".to_string()));
        assert!(replaced.contains(&"20250102".to_string()));
    }

    // Partitions one run failed to publish are published by the next run,
    // even outside its range.
    #[traced_test]
    #[tokio::test]
    async fn unpublished_partitions_carry_over_to_the_next_run() {
        let day = 24 * 60;
        let h = Harness::with_orders(vec![order(1, "new", t(5))]).await;
        h.clock.set(t(2 * day));

        let report = h
            .orchestrator_failing_publish(runtime_config(), PublishStep::Replace)
            .run(RunBounds {
                since: Some(t(0)),
                until: Some(t(15)),
            })
            .await
            .unwrap();
        assert!(report.published.is_empty());
        assert!(!report.publish_failures.is_empty());
        let state = h.journal.state().await.unwrap().unwrap();
        assert_eq!(
            state.extra.get(UNPUBLISHED_PARTITIONS),
            Some(&json!(["20250101"]))
        );

        h.source
            .insert(SOURCE_TABLE, vec![order(2, "new", t(day + 5))])
            .await;
        let report = h
            .orchestrator(runtime_config())
            .run(RunBounds {
                since: Some(t(day)),
                until: Some(t(day + 15)),
            })
            .await
            .unwrap();
        let replaced: Vec<String> = report.published.iter().map(|p| p.partition_id()).collect();
        assert!(replaced.contains(&"20250101".to_string()));
        assert!(replaced.contains(&"20250102".to_string()));
        assert_eq!(
            h.published().await,
            vec![(1, "new".to_string()), (2, "new".to_string())]
        );
        let state = h.journal.state().await.unwrap().unwrap();
        assert_eq!(state.extra.get(UNPUBLISHED_PARTITIONS), Some(&json!([])));
    }

    #[traced_test]
    #[tokio::test]
    async fn no_starting_point_is_an_error() {
        let h = Harness::with_orders(vec![order(1, "new", t(5))]).await;
        let config = RuntimeConfig {
            start_at: None,
            ..runtime_config()
        };
        let err = h
            .orchestrator(config)
            .run(RunBounds::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NoStartingPoint(_)));
        // the lock is released on the way out
        assert!(h.peer().journal.try_acquire_exclusive_lock().await.unwrap());
    }

    #[traced_test]
    #[tokio::test]
    async fn missing_sink_table_fails_bootstrap() {
        let h = Harness::with_orders(vec![]).await;
        let config = RuntimeConfig {
            staging_table: "nope".into(),
            ..runtime_config()
        };
        let err = h.orchestrator(config).run(hour()).await.unwrap_err();
        assert!(matches!(err, RunError::Bootstrap { .. }));
    }

    #[traced_test]
    #[tokio::test]
    async fn runs_from_a_settings_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"{
                "process": "orders",
                "journal": { "dsn": "postgres://journal@localhost/driftline" },
                "source": {
                    "table": "shop.orders",
                    "time_column": "updated_at",
                    "start_at": "2025-01-01T00:00:00Z"
                },
                "sink": { "table": "orders", "batch_size": 2 },
                "dedup": { "key": ["tenant", "order_id", "line"] }
            }"#,
        )
        .unwrap();
        let settings = Settings::load(Some(file.path())).await.unwrap();
        assert_eq!(settings.sink.raw_table(), RAW);

        assert_eq!(settings.journal_config().process_name.as_str(), PROCESS);

        let h = Harness::with_orders(vec![
            order(1, "new", t(1)),
            order(2, "new", t(2)),
            order(3, "new", t(3)),
        ])
        .await;
        let config = RuntimeConfig::from_settings(&settings).unwrap();
        assert_eq!(config.ingest.batch_size, 2);
        let report = h.orchestrator(config).run(hour()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.slices_done, 4);
        assert_eq!(h.published().await.len(), 3);
    }
}
