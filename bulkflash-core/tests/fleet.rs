mod support;

use bulkflash_core::FlashError;
use bulkflash_core::artifacts::ProvisioningMode;
use bulkflash_core::fleet::{Fleet, resolve_model};
use bulkflash_core::task::{Outcome, Phase, Step};
use std::time::Duration;
use support::*;

const FACTORY_DONE: [Phase; 8] = [
    Phase::Start,
    Phase::RebootedToBootloader,
    Phase::BootloaderUnlocked,
    Phase::FirmwarePartitionsFlashed,
    Phase::UpdatePackageFlashed,
    Phase::RebootedToBootloaderPostFlash,
    Phase::Rebooted,
    Phase::Done,
];

#[test]
fn factory_batch_without_key_reaches_done_on_every_device() {
    let tool = FakeTool::default()
        .with_device("A", FakeDevice::default())
        .with_device("B", FakeDevice::default());
    let sleeper = RecordingSleeper::default();
    let fleet = Fleet::new(&tool)
        .with_sleeper(&sleeper)
        .with_options(fast_options());

    let report = fleet
        .run(
            &[adb_device("A"), adb_device("B")],
            ProvisioningMode::FactoryImage,
            &FixedResolver(factory_artifacts(false)),
        )
        .unwrap();

    assert_eq!(report.model, "sargo");
    assert!(report.all_done());
    for serial in ["A", "B"] {
        let task = report.task(serial).unwrap();
        assert_eq!(task.phases, FACTORY_DONE);
        assert_eq!(tool.count(serial, "avb_custom_key"), 0);
        assert_eq!(tool.count(serial, "flashing lock"), 0);
    }

    assert_eq!(
        tool.calls_for("B"),
        [
            "adb reboot bootloader",
            "fastboot getvar unlocked",
            "fastboot flashing unlock",
            "fastboot getvar unlocked",
            "fastboot getvar partition-type:radio",
            "fastboot --slot all flash bootloader /img/bootloader-sargo.img",
            "fastboot reboot-bootloader",
            "fastboot --slot all flash radio /img/radio-sargo.img",
            "fastboot reboot-bootloader",
            "fastboot -w --skip-reboot update /img/sargo-img-1.zip",
            "fastboot reboot-bootloader",
            "fastboot reboot",
        ]
    );
    // Per device: one settle after each of the four reboots into the
    // bootloader plus one confirmation interval.
    assert_eq!(sleeper.count(), 2 * 5);
}

#[test]
fn radio_flash_failure_is_isolated_to_its_device() {
    let tool = FakeTool::default()
        .with_device("A", FakeDevice::default())
        .with_device("B", FakeDevice::default())
        .failing("A", "flash radio");
    let sleeper = RecordingSleeper::default();
    let fleet = Fleet::new(&tool)
        .with_sleeper(&sleeper)
        .with_options(fast_options());

    let report = fleet
        .run(
            &[adb_device("A"), adb_device("B")],
            ProvisioningMode::FactoryImage,
            &FixedResolver(factory_artifacts(false)),
        )
        .unwrap();

    let a = report.task("A").unwrap();
    assert_eq!(a.outcome.reason().as_deref(), Some("radio flash"));
    assert!(matches!(
        &a.outcome,
        Outcome::Failed {
            error: FlashError::CommandFailure { step: Step::RadioFlash, .. },
            ..
        }
    ));
    assert_eq!(
        a.phases,
        [Phase::Start, Phase::RebootedToBootloader, Phase::BootloaderUnlocked]
    );
    // Nothing after the failing step touched device A.
    assert_eq!(
        tool.calls_for("A").last().map(String::as_str),
        Some("fastboot --slot all flash radio /img/radio-sargo.img")
    );
    assert_eq!(tool.count("A", "update"), 0);

    let b = report.task("B").unwrap();
    assert!(b.outcome.is_done());
    assert_eq!(b.phases, FACTORY_DONE);
    assert_eq!(report.failed().count(), 1);
    assert_eq!(report.succeeded().count(), 1);
}

#[test]
fn every_task_reaches_a_terminal_state_when_several_fail() {
    let serials = ["A", "B", "C", "D"];
    let mut tool = FakeTool::default();
    for serial in serials {
        tool = tool.with_device(serial, FakeDevice::default());
    }
    let tool = tool
        .failing("A", "reboot bootloader")
        .failing("C", "update");
    let observer = RecordingObserver::default();
    let sleeper = RecordingSleeper::default();
    let fleet = Fleet::new(&tool)
        .with_sleeper(&sleeper)
        .with_observer(&observer)
        .with_options(fast_options());
    let devices: Vec<_> = serials.iter().map(|s| adb_device(s)).collect();

    let report = fleet
        .run(
            &devices,
            ProvisioningMode::FactoryImage,
            &FixedResolver(factory_artifacts(false)),
        )
        .unwrap();

    assert_eq!(report.tasks.len(), 4);
    assert_eq!(observer.finished.lock().unwrap().len(), 4);
    assert_eq!(
        report.task("A").unwrap().outcome.reason().as_deref(),
        Some("reboot to bootloader")
    );
    assert_eq!(
        report.task("C").unwrap().outcome.reason().as_deref(),
        Some("update package flash")
    );
    assert!(report.task("B").unwrap().outcome.is_done());
    assert!(report.task("D").unwrap().outcome.is_done());
    for task in &report.tasks {
        assert_strictly_increasing(&task.phases);
    }
}

#[test]
fn ota_sideload_follows_the_recovery_path_only() {
    let tool = FakeTool::default().with_device("A", FakeDevice::default());
    let observer = RecordingObserver::default();
    let sleeper = RecordingSleeper::default();
    let fleet = Fleet::new(&tool)
        .with_sleeper(&sleeper)
        .with_observer(&observer)
        .with_options(fast_options());

    let report = fleet
        .run(
            &[adb_device("A")],
            ProvisioningMode::OtaSideload,
            &FixedResolver(ota_artifacts()),
        )
        .unwrap();

    let task = report.task("A").unwrap();
    assert!(task.outcome.is_done());
    assert_eq!(
        task.phases,
        [
            Phase::Start,
            Phase::RebootedToRecovery,
            Phase::WaitingForSideload,
            Phase::OtaPushed,
            Phase::Done,
        ]
    );
    assert_eq!(tool.count("A", "flashing"), 0);
    assert_eq!(tool.count("A", "getvar unlocked"), 0);
    assert_eq!(tool.count("A", "flash "), 0);
    assert_eq!(tool.count("A", "bootloader"), 0);
    assert_eq!(
        tool.calls_for("A").last().map(String::as_str),
        Some("adb sideload /img/sargo-ota-1.zip")
    );
    assert_eq!(
        *observer.prompts.lock().unwrap(),
        [(bulkflash_core::device::DeviceSerial::new("A"), Step::SideloadWait)]
    );
}

#[test]
fn factory_mode_never_waits_for_sideload() {
    let tool = FakeTool::default().with_device("A", FakeDevice::default());
    let sleeper = RecordingSleeper::default();
    let fleet = Fleet::new(&tool)
        .with_sleeper(&sleeper)
        .with_options(fast_options());

    let report = fleet
        .run(
            &[adb_device("A")],
            ProvisioningMode::FactoryImage,
            &FixedResolver(factory_artifacts(true)),
        )
        .unwrap();

    assert!(report.all_done());
    assert_eq!(tool.count("A", "get-state"), 0);
    assert_eq!(tool.count("A", "sideload"), 0);
    assert!(!report.task("A").unwrap().phases.contains(&Phase::WaitingForSideload));
}

#[test]
fn sideload_wait_times_out_when_recovery_never_accepts() {
    let tool = FakeTool::default()
        .with_device("A", FakeDevice::default())
        .failing("A", "get-state");
    let sleeper = RecordingSleeper::default();
    let fleet = Fleet::new(&tool)
        .with_sleeper(&sleeper)
        .with_options(fast_options());

    let report = fleet
        .run(
            &[adb_device("A")],
            ProvisioningMode::OtaSideload,
            &FixedResolver(ota_artifacts()),
        )
        .unwrap();

    let task = report.task("A").unwrap();
    assert!(matches!(
        &task.outcome,
        Outcome::Failed {
            error: FlashError::ConfirmationTimeout { attempts: 4, .. },
            ..
        }
    ));
    assert_eq!(task.outcome.reason().as_deref(), Some("sideload wait"));
    assert_eq!(tool.count("A", "get-state"), 4);
    assert_eq!(tool.count("A", "sideload"), 0);
    assert_eq!(*sleeper.sleeps.lock().unwrap(), vec![Duration::from_secs(5); 3]);
}

#[test]
fn model_lookup_failure_stops_the_run_before_any_task() {
    let tool = FakeTool::default()
        .with_device("A", FakeDevice::default())
        .failing("A", "getprop")
        .failing("A", "getvar product");
    let sleeper = RecordingSleeper::default();
    let fleet = Fleet::new(&tool).with_sleeper(&sleeper);

    let err = fleet
        .run(
            &[adb_device("A")],
            ProvisioningMode::FactoryImage,
            &FixedResolver(factory_artifacts(false)),
        )
        .unwrap_err();

    assert!(matches!(err, FlashError::PrerequisiteMissing { .. }));
    assert!(err.is_run_level());
    assert_eq!(tool.count("A", "reboot"), 0);
}

#[test]
fn model_falls_back_to_bootloader_product() {
    let tool = FakeTool::default().with_device(
        "A",
        FakeDevice {
            product: "bonito".into(),
            ..FakeDevice::default()
        },
    );

    let model = resolve_model(&tool, &[fastboot_device("A")]).unwrap();

    assert_eq!(model, "bonito");
    assert_eq!(tool.calls_for("A"), ["fastboot getvar product"]);
}

#[test]
fn missing_artifacts_fail_the_run_before_any_task() {
    struct Missing;
    impl bulkflash_core::artifacts::ArtifactResolver for Missing {
        fn resolve(
            &self,
            model: &str,
            _mode: ProvisioningMode,
        ) -> bulkflash_core::Result<bulkflash_core::artifacts::RunArtifacts> {
            Err(FlashError::PrerequisiteMissing {
                what: format!("OS update package for {model}"),
            })
        }
    }

    let tool = FakeTool::default()
        .with_device("A", FakeDevice::default())
        .with_device("B", FakeDevice::default());
    let sleeper = RecordingSleeper::default();
    let fleet = Fleet::new(&tool).with_sleeper(&sleeper);

    let err = fleet
        .run(
            &[adb_device("A"), adb_device("B")],
            ProvisioningMode::FactoryImage,
            &Missing,
        )
        .unwrap_err();

    assert_eq!(err.to_string(), "missing prerequisite: OS update package for sargo");
    assert_eq!(tool.count("A", "reboot"), 0);
    assert!(tool.calls_for("B").is_empty());
}

#[test]
fn a_panicking_task_does_not_take_down_its_siblings() {
    let tool = FakeTool::default()
        .with_device("A", FakeDevice::default())
        .with_device("B", FakeDevice::default())
        .panicking("B");
    let observer = RecordingObserver::default();
    let sleeper = RecordingSleeper::default();
    let fleet = Fleet::new(&tool)
        .with_sleeper(&sleeper)
        .with_observer(&observer)
        .with_options(fast_options());

    let reports = fleet.flash_all(
        &[adb_device("A"), adb_device("B")],
        &factory_artifacts(false),
    );

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].serial.as_str(), "A");
    assert!(reports[0].outcome.is_done());
    assert!(matches!(
        &reports[1].outcome,
        Outcome::Failed {
            step: None,
            error: FlashError::TaskPanicked { .. },
        }
    ));
    // The panicked task is still reported as finished.
    assert_eq!(observer.finished.lock().unwrap().len(), 2);
}

#[test]
fn duplicate_serials_are_flashed_once() {
    let tool = FakeTool::default().with_device("A", FakeDevice::default());
    let sleeper = RecordingSleeper::default();
    let fleet = Fleet::new(&tool)
        .with_sleeper(&sleeper)
        .with_options(fast_options());

    let reports = fleet.flash_all(&[adb_device("A"), adb_device("A")], &factory_artifacts(false));

    assert_eq!(reports.len(), 1);
    assert_eq!(tool.count("A", "adb reboot bootloader"), 1);
}
