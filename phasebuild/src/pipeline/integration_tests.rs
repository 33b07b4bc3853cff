//! End-to-end tests driving real pipelines through the task queue.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    use crate::build_log::LogStream;
    use crate::config::PipelineConfig;
    use crate::core::{DeviceInfo, DeviceKind, Phase, PhaseMask, PhaseSpec, PipelinePhase, Severity};
    use crate::diagnostics::ErrorFormatFlags;
    use crate::errors::{BuildError, BuildResult};
    use crate::events::PipelineEvent;
    use crate::pipeline::{Pipeline, PipelineAddin, PipelineBuilder};
    use crate::runtime::MockRuntime;
    use crate::stages::{FnStage, Stage, StageContext};
    use crate::testing::{CollectingEventSink, MockDeployStrategy, MockDevice, MockStage, RunOrder};

    const GCC_FORMAT: &str =
        r"(?<filename>[a-zA-Z0-9\+\-\.\/_]+):(?<line>\d+):(?<column>\d+): (?<level>[\w\s]+): (?<message>.*)";

    fn config(dir: &TempDir) -> PipelineConfig {
        PipelineConfig::new("test", dir.path().join("src")).with_cache_dir(dir.path().join("cache"))
    }

    async fn loaded(builder: PipelineBuilder) -> Pipeline {
        let pipeline = builder.build().unwrap();
        pipeline.load().await.unwrap();
        pipeline
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn names(pipeline: &Pipeline) -> Vec<String> {
        pipeline.stages().iter().map(|s| s.name().to_string()).collect()
    }

    #[tokio::test]
    async fn test_stages_sorted_by_phase_modifier_and_priority() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;

        pipeline.attach(PhaseSpec::after(Phase::Build), 0, MockStage::new("post-build"));
        pipeline.attach(Phase::Build, 5, MockStage::new("make-docs"));
        pipeline.attach(Phase::Build, -1, MockStage::new("make"));
        pipeline.attach(Phase::Configure, 100, MockStage::new("configure"));
        pipeline.attach(PhaseSpec::before(Phase::Build), 50, MockStage::new("pre-build"));
        pipeline.attach(Phase::Build, 5, MockStage::new("make-tests"));

        assert_eq!(
            names(&pipeline),
            vec!["configure", "pre-build", "make", "make-docs", "make-tests", "post-build"]
        );
    }

    #[tokio::test]
    async fn test_attach_flags_rejects_invalid_bits() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;

        let both = Phase::Build.bit() | Phase::Install.bit();
        assert!(pipeline.attach_flags(both, 0, Box::new(MockStage::new("bad"))).is_none());
        assert!(pipeline
            .attach_flags(PhaseSpec::after(Phase::Install).to_bits(), 0, Box::new(MockStage::new("ok")))
            .is_some());
        assert_eq!(names(&pipeline), vec!["ok"]);
    }

    #[tokio::test]
    async fn test_request_phase_reports_pending_work() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        let id = pipeline.attach(Phase::Build, 0, MockStage::new("make"));

        assert!(!pipeline.request_phase(Phase::Configure));
        assert!(pipeline.request_phase(Phase::Build));

        pipeline.get_stage_by_id(id).unwrap().set_completed(true);
        assert!(!pipeline.request_phase(Phase::Install));
    }

    #[tokio::test]
    async fn test_build_runs_requested_stages_in_order() {
        let dir = tempdir().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = loaded(PipelineBuilder::new(config(&dir)).event_sink(events.clone())).await;
        let order = RunOrder::default();

        pipeline.attach(Phase::Install, 0, MockStage::new("install").record_into(&order));
        pipeline.attach(Phase::Configure, 0, MockStage::new("configure").record_into(&order));
        pipeline.attach(Phase::Export, 0, MockStage::new("export").record_into(&order));
        pipeline.attach(Phase::Build, 0, MockStage::new("make").record_into(&order));

        pipeline.build_async(Phase::Install, None).await.unwrap();

        assert_eq!(*order.lock(), vec!["configure", "make", "install"]);
        let completed: Vec<bool> = pipeline.stages().iter().map(|s| s.completed()).collect();
        assert_eq!(completed, vec![true, true, true, false]);
        assert_eq!(pipeline.get_phase(), PipelinePhase::Finished);
        assert!(!pipeline.is_busy());
        assert_eq!(pipeline.get_message(), "Ready");

        let emitted = events.pipeline_events();
        assert!(emitted.contains(&PipelineEvent::Started {
            phase: Some(Phase::Install)
        }));
        assert!(emitted.contains(&PipelineEvent::Finished { failed: false }));
    }

    #[tokio::test]
    async fn test_completed_stages_are_not_rebuilt() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        let make = MockStage::new("make");
        let counts = make.counters();
        pipeline.attach(Phase::Build, 0, make);

        pipeline.build_async(Phase::Build, None).await.unwrap();
        pipeline.build_async(Phase::Build, None).await.unwrap();
        assert_eq!(counts.builds(), 1);

        pipeline.invalidate_phase(Phase::Build);
        pipeline.build_async(Phase::Build, None).await.unwrap();
        assert_eq!(counts.builds(), 2);
    }

    #[tokio::test]
    async fn test_always_run_stage_builds_every_time() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        let check = MockStage::new("check").always_run();
        let counts = check.counters();
        pipeline.attach(Phase::Build, 0, check);

        pipeline.build_async(Phase::Build, None).await.unwrap();
        pipeline.build_async(Phase::Build, None).await.unwrap();

        assert_eq!(counts.queries(), 2);
        assert_eq!(counts.builds(), 2);
    }

    #[tokio::test]
    async fn test_build_targets_reach_stages() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        let make = MockStage::new("make");
        let counts = make.counters();
        pipeline.attach(Phase::Build, 0, make);

        pipeline
            .build_targets_async(Phase::Build, vec!["libfoo.so".to_string()], None)
            .await
            .unwrap();

        assert_eq!(counts.last_targets(), Some(vec!["libfoo.so".to_string()]));
    }

    #[tokio::test]
    async fn test_rebuild_reaps_and_reruns_stages() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        let make = MockStage::new("make");
        let counts = make.counters();
        pipeline.attach(Phase::Build, 0, make);

        pipeline.build_async(Phase::Build, None).await.unwrap();
        let object = pipeline.build_builddir_path(&["main.o"]);
        std::fs::write(&object, b"").unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        pipeline.add_log_observer(move |_, line| sink.lock().push(line.to_string()));

        pipeline.rebuild_async(Some(Phase::Build), None, None).await.unwrap();

        assert_eq!(counts.builds(), 2);
        assert!(!object.exists());
        assert!(pipeline.builddir().exists());
        assert!(log.lock().iter().any(|line| line == "Removing build directories"));
    }

    #[tokio::test]
    async fn test_rebuild_without_phase_only_reaps() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        let stray = dir.path().join("stray.txt");
        std::fs::write(&stray, b"").unwrap();
        let make = MockStage::new("make").with_reap(&stray);
        let counts = make.counters();
        pipeline.attach(Phase::Build, 0, make);

        pipeline.build_async(Phase::Build, None).await.unwrap();
        pipeline.rebuild_async(None, None, None).await.unwrap();

        assert_eq!(counts.builds(), 1);
        assert!(!stray.exists());
        assert!(!pipeline.stages()[0].completed());
    }

    #[tokio::test]
    async fn test_detach_restores_registry() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        pipeline.attach(Phase::Configure, 0, MockStage::new("configure"));
        pipeline.attach(Phase::Install, 0, MockStage::new("install"));
        let before = names(&pipeline);

        let id = pipeline.attach(Phase::Build, 0, MockStage::new("make"));
        assert_eq!(pipeline.stages().len(), 3);
        pipeline.detach(id);

        assert_eq!(names(&pipeline), before);
        assert!(pipeline.get_stage_by_id(id).is_none());
        pipeline.detach(id);
    }

    #[tokio::test]
    async fn test_stage_output_produces_diagnostics() {
        let dir = tempdir().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = loaded(
            PipelineBuilder::new(config(&dir))
                .event_sink(events.clone())
                .error_format(GCC_FORMAT, ErrorFormatFlags::default()),
        )
        .await;

        pipeline.attach(
            Phase::Build,
            0,
            MockStage::new("make")
                .with_output(LogStream::Stderr, "main.c:3:5: error: expected ';'")
                .with_output(LogStream::Stdout, "util.c:1:1: warning: ignored on stdout"),
        );
        pipeline.build_async(Phase::Build, None).await.unwrap();

        let diagnostics: Vec<_> = events
            .pipeline_events()
            .into_iter()
            .filter_map(|event| match event {
                PipelineEvent::Diagnostic { diagnostic } => Some(diagnostic),
                _ => None,
            })
            .collect();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Severity::Error);
        assert_eq!(diagnostics[0].message, "expected ';'");
    }

    #[tokio::test]
    async fn test_stdout_diagnostics_when_any_stage_asks() {
        let dir = tempdir().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = loaded(
            PipelineBuilder::new(config(&dir))
                .event_sink(events.clone())
                .error_format(GCC_FORMAT, ErrorFormatFlags::default()),
        )
        .await;

        pipeline.attach(Phase::Configure, 0, MockStage::new("meson").with_check_stdout());
        pipeline.attach(
            Phase::Build,
            0,
            MockStage::new("ninja").with_output(LogStream::Stdout, "util.c:1:1: warning: unused variable"),
        );
        pipeline.build_async(Phase::Build, None).await.unwrap();

        assert_eq!(events.events_of_type("pipeline.diagnostic").len(), 1);
    }

    #[tokio::test]
    async fn test_feed_pty_waits_for_complete_lines() {
        let dir = tempdir().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = PipelineBuilder::new(config(&dir))
            .event_sink(events.clone())
            .error_format(GCC_FORMAT, ErrorFormatFlags::default())
            .build()
            .unwrap();

        pipeline.feed_pty(b"main.c:3:5: error: ");
        assert!(events.is_empty());
        pipeline.feed_pty(b"boom\nmain.c:4:1: warn");
        assert_eq!(events.events_of_type("pipeline.diagnostic").len(), 1);
        pipeline.feed_pty(b"ing: later\n");
        assert_eq!(events.events_of_type("pipeline.diagnostic").len(), 2);
    }

    #[tokio::test]
    async fn test_clean_walks_backwards_from_lowest_phase() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        let order = RunOrder::default();

        let autogen = MockStage::new("autogen").record_into(&order);
        let autogen_counts = autogen.counters();
        pipeline.attach(Phase::Autogen, 0, autogen);
        pipeline.attach(Phase::Configure, 0, MockStage::new("configure").record_into(&order));
        pipeline.attach(Phase::Build, 0, MockStage::new("make").record_into(&order));
        pipeline.attach(Phase::Install, 0, MockStage::new("install").record_into(&order));

        pipeline.build_async(Phase::Install, None).await.unwrap();
        order.lock().clear();

        pipeline
            .clean_async(PhaseMask::from(Phase::Configure) | Phase::Install, None)
            .await
            .unwrap();

        assert_eq!(*order.lock(), vec!["install", "make", "configure"]);
        assert_eq!(autogen_counts.cleans(), 0);
        let completed: Vec<bool> = pipeline.stages().iter().map(|s| s.completed()).collect();
        assert_eq!(completed, vec![true, false, false, false]);
    }

    /// Cleans scratch files but keeps its output, so it stays completed.
    #[derive(Debug)]
    struct KeepOutputStage;

    #[async_trait]
    impl Stage for KeepOutputStage {
        fn name(&self) -> &str {
            "keep-output"
        }

        async fn build(&self, _ctx: &StageContext) -> BuildResult<()> {
            Ok(())
        }

        async fn clean(&self, _ctx: &StageContext) -> BuildResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_clean_leaves_completed_to_the_stage() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        pipeline.attach(Phase::Build, 0, KeepOutputStage);
        pipeline.attach(Phase::Build, 1, FnStage::new("default-clean", |_| Ok(())));

        pipeline.build_async(Phase::Build, None).await.unwrap();
        pipeline.clean_async(Phase::Build, None).await.unwrap();

        let completed: Vec<bool> = pipeline.stages().iter().map(|s| s.completed()).collect();
        assert_eq!(completed, vec![true, false]);
    }

    #[tokio::test]
    async fn test_clean_with_nothing_to_do_resolves_immediately() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        pipeline.attach(Phase::Configure, 0, MockStage::new("configure"));

        pipeline.clean_async(Phase::Install, None).await.unwrap();
        pipeline.clean_async(PhaseMask::EMPTY, None).await.unwrap();
        assert!(!pipeline.is_busy());
    }

    #[tokio::test]
    async fn test_deploy_negotiation_picks_lowest_priority() {
        let dir = tempdir().unwrap();
        let ten = Arc::new(MockDeployStrategy::new("ten", Ok(10)));
        let pipeline = loaded(
            PipelineBuilder::new(config(&dir))
                .deploy_strategy(Arc::new(MockDeployStrategy::new("fifty", Ok(50))))
                .deploy_strategy(ten.clone())
                .deploy_strategy(Arc::new(MockDeployStrategy::new(
                    "unsupported",
                    Err(BuildError::NotSupported("no device".into())),
                ))),
        )
        .await;

        tokio::time::timeout(Duration::from_secs(5), pipeline.wait_deploy_negotiation())
            .await
            .unwrap();
        assert_eq!(pipeline.get_deploy_strategy().name(), "ten");

        let fractions = Arc::new(Mutex::new(Vec::new()));
        let sink = fractions.clone();
        pipeline
            .deploy_async(Some(Arc::new(move |f| sink.lock().push(f))), None)
            .await
            .unwrap();

        assert_eq!(ten.deploys(), 1);
        assert_eq!(*fractions.lock(), vec![1.0]);

        pipeline.unload();
        assert_eq!(pipeline.get_deploy_strategy().name(), "local");
    }

    #[tokio::test]
    async fn test_local_deploy_builds_through_install() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        let install = MockStage::new("install");
        let counts = install.counters();
        pipeline.attach(Phase::Install, 0, install);

        pipeline.wait_deploy_negotiation().await;
        assert_eq!(pipeline.get_deploy_strategy().name(), "local");
        pipeline.deploy_async(None, None).await.unwrap();

        assert_eq!(counts.builds(), 1);
    }

    #[tokio::test]
    async fn test_cancel_fails_running_task_only() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        let make = MockStage::new("make");
        let make_counts = make.counters();
        let install = MockStage::new("install").with_delay(Duration::from_secs(30));
        let install_counts = install.counters();
        pipeline.attach(Phase::Build, 0, make);
        pipeline.attach(Phase::Install, 0, install);

        let running = pipeline.build_async(Phase::Install, None);
        wait_until(|| install_counts.builds() == 1).await;
        pipeline.cancel();

        let err = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(pipeline.get_phase(), PipelinePhase::Failed);

        pipeline.invalidate_phase(Phase::Build);
        pipeline.build_async(Phase::Build, None).await.unwrap();
        assert_eq!(make_counts.builds(), 2);
    }

    #[tokio::test]
    async fn test_finished_tasks_release_the_shared_token() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        pipeline.attach(Phase::Build, 0, MockStage::new("make").always_run());

        for _ in 0..200 {
            pipeline.build_async(Phase::Build, None).await.unwrap();
        }
        pipeline.clean_async(Phase::Build, None).await.unwrap();

        let shared = pipeline.cancel_token();
        wait_until(|| shared.callback_count() == 0).await;
    }

    #[tokio::test]
    async fn test_requests_during_a_build() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        pipeline.attach(Phase::Configure, 0, MockStage::new("configure"));
        let make = MockStage::new("make").with_delay(Duration::from_millis(300));
        let counts = make.counters();
        pipeline.attach(Phase::Build, 0, make);

        let first = pipeline.build_async(Phase::Build, None);
        wait_until(|| counts.builds() == 1).await;
        assert!(pipeline.is_busy());
        assert_eq!(pipeline.get_message(), "make");

        // Already passed: resolves without queueing.
        let lower = pipeline.build_async(Phase::Configure, None);
        tokio::time::timeout(Duration::from_millis(100), lower)
            .await
            .unwrap()
            .unwrap();

        // Same phase: waits for its own turn.
        let mut same = pipeline.build_async(Phase::Build, None);
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut same)
            .await
            .is_err());

        first.await.unwrap();
        same.await.unwrap();
        assert_eq!(counts.builds(), 1);
    }

    #[tokio::test]
    async fn test_queued_lower_builds_complete_early() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        let gate = MockStage::new("gate").with_delay(Duration::from_millis(200));
        let gate_counts = gate.counters();
        pipeline.attach(Phase::Autogen, 0, gate);
        pipeline.attach(Phase::Configure, 0, MockStage::new("configure"));
        pipeline.attach(Phase::Install, 0, MockStage::new("install").with_delay(Duration::from_secs(30)));

        let running = pipeline.build_async(Phase::Install, None);
        wait_until(|| gate_counts.builds() == 1).await;
        // Queued while the walk is below Configure, so no short circuit.
        let queued = pipeline.build_async(Phase::Configure, None);

        tokio::time::timeout(Duration::from_secs(5), queued)
            .await
            .unwrap()
            .unwrap();
        assert!(pipeline.is_busy());

        pipeline.cancel();
        assert!(running.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_pipeline_needs_rebuild_for_low_phases() {
        let dir = tempdir().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = loaded(PipelineBuilder::new(config(&dir)).event_sink(events.clone())).await;
        let configure = MockStage::new("configure").failing("bad option");
        let counts = configure.counters();
        pipeline.attach(Phase::Configure, 0, configure);
        pipeline.attach(Phase::Build, 0, MockStage::new("make"));

        let err = pipeline.build_async(Phase::Build, None).await.unwrap_err();
        assert!(matches!(err, BuildError::StageFailed { .. }));
        assert_eq!(pipeline.get_phase(), PipelinePhase::Failed);
        assert_eq!(pipeline.get_message(), "Failed");

        events.clear();
        let err = pipeline.build_async(Phase::Configure, None).await.unwrap_err();
        assert!(matches!(err, BuildError::NeedsRebuild { phase: Phase::Configure }));
        assert_eq!(counts.builds(), 1);
        assert!(!events
            .pipeline_events()
            .iter()
            .any(|e| matches!(e, PipelineEvent::Started { .. })));

        counts.set_failure(None);
        pipeline.rebuild_async(Some(Phase::Build), None, None).await.unwrap();
        assert_eq!(pipeline.get_phase(), PipelinePhase::Finished);
        assert!(pipeline.has_configured());
    }

    #[tokio::test]
    async fn test_transient_stages_released_after_task() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        pipeline.attach(Phase::Build, 0, MockStage::new("make"));
        let once = MockStage::new("run-once").transient();
        let counts = once.counters();
        pipeline.attach(Phase::Install, 0, once);

        pipeline.build_async(Phase::Install, None).await.unwrap();

        assert_eq!(counts.builds(), 1);
        assert_eq!(names(&pipeline), vec!["make"]);
        assert_eq!(pipeline.get_phase(), PipelinePhase::Finished);
    }

    #[tokio::test]
    async fn test_transients_are_released_from_the_back() {
        let dir = tempdir().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = loaded(PipelineBuilder::new(config(&dir)).event_sink(events.clone())).await;
        pipeline.attach(Phase::Configure, 0, MockStage::new("configure"));
        pipeline.attach(Phase::Build, 0, MockStage::new("codegen").transient());
        pipeline.attach(Phase::Build, 1, MockStage::new("make"));
        pipeline.attach(Phase::Install, 0, MockStage::new("install").transient());

        pipeline.build_async(Phase::Install, None).await.unwrap();

        let removed: Vec<(usize, String)> = events
            .pipeline_events()
            .into_iter()
            .filter_map(|event| match event {
                PipelineEvent::StageRemoved { position, name, .. } => Some((position, name)),
                _ => None,
            })
            .collect();
        assert_eq!(
            removed,
            vec![(3, "install".to_string()), (1, "codegen".to_string())]
        );
        assert_eq!(names(&pipeline), vec!["configure", "make"]);
    }

    #[tokio::test]
    async fn test_chained_stages_build_once() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        let make = MockStage::new("make").chains_with(["make-install"]);
        let install = MockStage::new("make-install");
        let install_counts = install.counters();
        pipeline.attach(Phase::Build, 0, make);
        pipeline.attach(Phase::Install, 0, install);

        pipeline.build_async(Phase::Install, None).await.unwrap();

        assert_eq!(install_counts.builds(), 0);
        assert!(pipeline.stages().iter().all(|s| s.completed()));
    }

    #[tokio::test]
    async fn test_panicking_stage_fails_task() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        pipeline.attach(Phase::Build, 0, MockStage::new("boom").panicking());

        let err = pipeline.build_async(Phase::Build, None).await.unwrap_err();

        assert!(matches!(err, BuildError::StageFailed { .. }));
        assert!(!pipeline.is_busy());
        assert_eq!(pipeline.get_phase(), PipelinePhase::Failed);
    }

    #[tokio::test]
    async fn test_has_configured() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir))).await;
        pipeline.attach(Phase::Autogen, 0, MockStage::new("autogen"));
        pipeline.attach(Phase::Configure, 0, MockStage::new("configure"));
        assert!(!pipeline.has_configured());

        pipeline.build_async(Phase::Configure, None).await.unwrap();
        // Nothing above configure yet.
        assert!(!pipeline.has_configured());

        pipeline.attach(Phase::Build, 0, MockStage::new("make"));
        assert!(pipeline.has_configured());
        assert!(!pipeline.get_can_export());

        pipeline.attach(Phase::Export, 0, MockStage::new("bundle"));
        assert!(pipeline.get_can_export());
    }

    #[tokio::test]
    async fn test_set_message_strips_tool_prefixes() {
        let dir = tempdir().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let pipeline = PipelineBuilder::new(config(&dir))
            .event_sink(events.clone())
            .build()
            .unwrap();

        pipeline.set_message(Some("flatpak-builder: Downloading sources"));

        assert_eq!(
            events.pipeline_events(),
            vec![PipelineEvent::MessageChanged {
                message: Some("Downloading sources".to_string())
            }]
        );
        assert_eq!(pipeline.get_message(), "Ready");
    }

    #[tokio::test]
    async fn test_builddir_failure_fails_queued_tasks() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir).with_builddir(blocker.join("build")))).await;
        pipeline.attach(Phase::Build, 0, MockStage::new("make"));

        let err = pipeline.build_async(Phase::Build, None).await.unwrap_err();

        assert!(matches!(err, BuildError::Io(_)));
        assert!(!pipeline.is_busy());
    }

    #[tokio::test]
    async fn test_builddir_is_not_checked_while_busy() {
        let dir = tempdir().unwrap();
        let builddir = dir.path().join("build");
        let pipeline = loaded(PipelineBuilder::new(config(&dir).with_builddir(&builddir))).await;
        let make = MockStage::new("make").with_delay(Duration::from_millis(500));
        let make_counts = make.counters();
        let install = MockStage::new("install");
        let install_counts = install.counters();
        pipeline.attach(Phase::Build, 0, make);
        pipeline.attach(Phase::Install, 0, install);

        let running = pipeline.build_async(Phase::Build, None);
        wait_until(|| make_counts.builds() == 1).await;

        std::fs::remove_dir_all(&builddir).unwrap();
        std::fs::write(&builddir, b"").unwrap();
        let queued = pipeline.build_async(Phase::Install, None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::remove_file(&builddir).unwrap();

        running.await.unwrap();
        queued.await.unwrap();
        assert_eq!(install_counts.builds(), 1);
    }

    #[tokio::test]
    async fn test_requests_before_load_and_after_breaking() {
        let dir = tempdir().unwrap();
        let pipeline = PipelineBuilder::new(config(&dir))
            .device(Arc::new(MockDevice::new(
                "board",
                Err(BuildError::stage_failed("device", "unreachable")),
            )))
            .build()
            .unwrap();

        let err = pipeline.build_async(Phase::Build, None).await.unwrap_err();
        assert!(matches!(err, BuildError::NotLoaded));

        assert!(pipeline.load().await.is_err());
        assert!(pipeline.is_broken());
        assert!(!pipeline.has_configured());
        let err = pipeline.clean_async(Phase::Build, None).await.unwrap_err();
        assert!(matches!(err, BuildError::Broken));
    }

    #[tokio::test]
    async fn test_device_info_drives_host_queries() {
        let dir = tempdir().unwrap();
        let info = DeviceInfo::new(DeviceKind::Tablet, "riscv64", "linux", "gnu");
        let pipeline = PipelineBuilder::new(config(&dir))
            .device(Arc::new(MockDevice::new("tablet", Ok(info))))
            .build()
            .unwrap();
        assert!(pipeline.is_native());

        pipeline.load().await.unwrap();

        assert_eq!(pipeline.host_triplet(), "riscv64-linux-gnu");
        assert_eq!(pipeline.arch(), "riscv64");
        assert!(!pipeline.is_native());
        assert_eq!(pipeline.ref_toolchain().id(), "default");
    }

    #[tokio::test]
    async fn test_run_context_layers_runtime_and_config() {
        let dir = tempdir().unwrap();
        let tools = dir.path().join("tools");
        std::fs::create_dir_all(&tools).unwrap();
        std::fs::write(tools.join("meson"), b"").unwrap();

        let mut runtime = MockRuntime::new();
        runtime
            .expect_prepare_to_build()
            .returning(|ctx| ctx.setenv("FLATPAK_ID", "org.example.App"));
        runtime.expect_contains_program_in_path().returning(|_| false);

        let mut cfg = config(&dir).with_env("CFLAGS", "-O2");
        cfg.prepend_path.push(tools.clone());
        let pipeline = PipelineBuilder::new(cfg).runtime(Arc::new(runtime)).build().unwrap();

        let ctx = pipeline.create_run_context();
        assert_eq!(ctx.getenv("FLATPAK_ID"), Some("org.example.App"));
        assert_eq!(ctx.getenv("CFLAGS"), Some("-O2"));
        assert_eq!(ctx.getenv("BUILDDIR"), pipeline.builddir().to_str());
        assert_eq!(ctx.cwd(), Some(pipeline.builddir()));
        let path = ctx.search_path(Some("/usr/bin")).unwrap();
        assert!(std::env::split_paths(&path).next() == Some(tools));

        assert!(pipeline.contains_program_in_path("meson"));
        assert!(!pipeline.contains_program_in_path("ninja"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_config_commands_become_tracked_stages() {
        let dir = tempdir().unwrap();
        let events = Arc::new(CollectingEventSink::new());
        let cfg = config(&dir)
            .with_build_command("echo built")
            .with_post_install_command("echo installed");
        let pipeline = loaded(PipelineBuilder::new(cfg).event_sink(events.clone())).await;
        pipeline.attach(Phase::Build, 0, MockStage::new("make"));

        assert_eq!(
            names(&pipeline),
            vec!["make", "Build (echo built)", "Post-install (echo installed)"]
        );

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        pipeline.add_log_observer(move |stream, line| sink.lock().push((stream, line.to_string())));
        pipeline.build_async(Phase::Install, None).await.unwrap();
        assert!(lines.lock().contains(&(LogStream::Stdout, "built".to_string())));
        assert!(lines.lock().contains(&(LogStream::Stdout, "installed".to_string())));

        pipeline.unload();
        assert_eq!(names(&pipeline), vec!["make"]);
        assert!(events.pipeline_events().contains(&PipelineEvent::Unloaded));
    }

    #[derive(Debug)]
    struct LintAddin;

    #[async_trait]
    impl PipelineAddin for LintAddin {
        fn name(&self) -> &str {
            "lint"
        }

        async fn load(&self, pipeline: &Pipeline) -> BuildResult<()> {
            let id = pipeline.attach(Phase::Build, 10, MockStage::new("lint"));
            pipeline.track(id);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct BrokenAddin;

    #[async_trait]
    impl PipelineAddin for BrokenAddin {
        fn name(&self) -> &str {
            "broken"
        }

        async fn load(&self, _pipeline: &Pipeline) -> BuildResult<()> {
            Err(BuildError::Config("missing build system".into()))
        }
    }

    #[tokio::test]
    async fn test_addin_stages_follow_load_and_unload() {
        let dir = tempdir().unwrap();
        let pipeline = loaded(PipelineBuilder::new(config(&dir)).addin(Arc::new(LintAddin))).await;
        assert!(pipeline.is_ready());
        assert_eq!(names(&pipeline), vec!["lint"]);

        pipeline.set_config_ready(false);
        assert!(!pipeline.is_ready());
        assert!(pipeline.stages().is_empty());
        let err = pipeline.build_async(Phase::Build, None).await.unwrap_err();
        assert!(matches!(err, BuildError::NotLoaded));

        pipeline.set_config_ready(true);
        wait_until(|| pipeline.is_ready()).await;
        assert_eq!(names(&pipeline), vec!["lint"]);
    }

    #[tokio::test]
    async fn test_failing_addin_breaks_pipeline() {
        let dir = tempdir().unwrap();
        let pipeline = PipelineBuilder::new(config(&dir))
            .addin(Arc::new(BrokenAddin))
            .build()
            .unwrap();

        let err = pipeline.load().await.unwrap_err();

        assert!(matches!(err, BuildError::Config(_)));
        assert!(pipeline.is_broken());
        assert!(!pipeline.is_ready());
    }
}
