extern crate leger;

use leger::paths::Layout;
use leger::{backup, diff, staging, validate};
use std::fs;
use std::path::PathBuf;

/// Fresh scratch layout per test
fn setup(name: &str) -> (Layout, PathBuf) {
    let root = std::env::temp_dir().join(format!("leger-it-{}", name));
    let _ = fs::remove_dir_all(&root);
    fs::create_dir_all(&root).unwrap();
    let layout = Layout::rooted(&root);
    layout.ensure_data_dirs().unwrap();
    (layout, root)
}

fn write_bundle(dir: &PathBuf, image: &str, port: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join("web.container"),
        format!("[Container]\nImage={}\nPublishPort={}\n", image, port),
    )
    .unwrap();
    fs::write(dir.join(".leger.yaml"), "name: web\nversion: 1\n").unwrap();
}

#[test]
fn conflicting_publish_ports_are_rejected_once() {
    let (_, root) = setup("ports");
    let bundle = root.join("bundle");
    fs::create_dir_all(&bundle).unwrap();
    fs::write(
        bundle.join("api.container"),
        "[Container]\nImage=api:1\nPublishPort=8080:80\n",
    )
    .unwrap();
    fs::write(
        bundle.join("web.container"),
        "[Container]\nImage=web:1\nPublishPort=8080:80\n",
    )
    .unwrap();

    let res = validate::bundle(&bundle).unwrap();
    assert!(!res.valid);
    assert_eq!(res.port_conflicts.len(), 1);
    let conflict = &res.port_conflicts[0];
    assert_eq!(conflict.port, "8080/tcp");
    assert_eq!(conflict.units.len(), 2);
    assert!(conflict.units.contains(&"api.container".to_string()));
    assert!(conflict.units.contains(&"web.container".to_string()));
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn three_service_cycle_is_reported_as_one_rotation() {
    let (_, root) = setup("cycle");
    let bundle = root.join("bundle");
    fs::create_dir_all(&bundle).unwrap();
    for (svc, dep) in &[("a", "b"), ("b", "c"), ("c", "a")] {
        fs::write(
            bundle.join(format!("{}.container", svc)),
            format!("[Unit]\nAfter={}.service\n\n[Container]\nImage=x\n", dep),
        )
        .unwrap();
    }
    let res = validate::bundle(&bundle).unwrap();
    assert!(!res.valid);
    assert_eq!(res.circular.len(), 1);
    let cycle = &res.circular[0];
    assert_eq!(cycle.len(), 3);
    let mut doubled = cycle.clone();
    doubled.extend(cycle.clone());
    assert!(doubled.join(",").contains("a,b,c"));
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn staging_metadata_never_reaches_active() {
    let (layout, root) = setup("isolation");
    let bundle = root.join("bundle");
    write_bundle(&bundle, "nginx:1", "8080:80");

    let meta = staging::StagingMetadata {
        deployment_name: "web".into(),
        source_url: bundle.display().to_string(),
        staged_version: "2".into(),
        current_version: "1".into(),
        staged_at: chrono::Utc::now(),
        checksum: staging::tree_checksum(&bundle).unwrap(),
    };
    staging::stage(&layout, "web", &bundle, &meta).unwrap();

    // simulate the activation copy apply performs
    let active = layout.active_root().join("web");
    staging::copy_tree(
        &layout.staged_root().join("web"),
        &active,
        &[staging::STAGING_META],
    )
    .unwrap();

    assert!(layout.staged_root().join("web").join(staging::STAGING_META).is_file());
    assert!(!active.join(staging::STAGING_META).exists());
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn diff_partitions_are_disjoint_and_exhaustive() {
    let (layout, root) = setup("diffparts");
    let active = layout.active_root().join("web");
    let staged = layout.staged_root().join("web");
    fs::create_dir_all(&active).unwrap();
    fs::create_dir_all(&staged).unwrap();

    fs::write(active.join("same.container"), "[Container]\nImage=s\n").unwrap();
    fs::write(staged.join("same.container"), "[Container]\nImage=s\n").unwrap();
    fs::write(active.join("old.container"), "[Container]\nImage=o\n").unwrap();
    fs::write(staged.join("new.container"), "[Container]\nImage=n\n").unwrap();
    fs::write(active.join("mod.container"), "[Container]\nImage=1\n").unwrap();
    fs::write(staged.join("mod.container"), "[Container]\nImage=2\n").unwrap();

    let d = diff::trees(&active, &staged).unwrap();
    let added: Vec<_> = d.added.clone();
    let removed: Vec<_> = d.removed.clone();
    let modified: Vec<_> = d.modified.iter().map(|m| m.path.clone()).collect();

    for f in &added {
        assert!(!removed.contains(f));
        assert!(!modified.contains(f));
    }
    for f in &removed {
        assert!(!modified.contains(f));
    }
    let mut all = added;
    all.extend(removed);
    all.extend(modified);
    all.sort();
    assert_eq!(all, vec!["mod.container", "new.container", "old.container"]);
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn backup_is_self_contained_and_ids_sort_chronologically() {
    let (layout, root) = setup("backupids");
    let active = layout.active_root().join("web");
    fs::create_dir_all(&active).unwrap();
    fs::write(active.join("web.container"), "[Container]\nImage=x\n").unwrap();

    let meta = backup::create(&layout, "web", "pre-apply-safety").unwrap();
    assert_eq!(meta.kind, "automatic");

    // every archive path listed must exist under the backup dir
    let (found, dir) = backup::find(&layout, &meta.id).unwrap();
    for vb in &found.volumes {
        assert!(dir.join(&vb.archive_path).is_file());
    }
    assert!(dir.join(backup::BACKUP_META).is_file());

    // lexicographic id order == chronological order for fixed-width stamps
    let a = "web-2024-01-02-093000";
    let b = "web-2024-01-10-093000";
    let c = "web-2024-11-02-093000";
    let mut ids = vec![c, a, b];
    ids.sort();
    assert_eq!(ids, vec![a, b, c]);
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn stage_and_discard_leave_no_trace() {
    let (layout, root) = setup("discard");
    let bundle = root.join("bundle");
    write_bundle(&bundle, "nginx:2", "9090:80");

    let active = layout.active_root().join("web");
    fs::create_dir_all(&active).unwrap();
    fs::write(active.join("web.container"), "[Container]\nImage=nginx:1\n").unwrap();
    let before = staging::tree_checksum(&active).unwrap();

    let meta = staging::StagingMetadata {
        deployment_name: "web".into(),
        source_url: bundle.display().to_string(),
        staged_version: "2".into(),
        current_version: "1".into(),
        staged_at: chrono::Utc::now(),
        checksum: staging::tree_checksum(&bundle).unwrap(),
    };
    staging::stage(&layout, "web", &bundle, &meta).unwrap();
    assert!(staging::is_staged(&layout, "web"));

    staging::discard(&layout, "web").unwrap();
    assert!(!layout.staged_root().join("web").exists());
    assert_eq!(staging::tree_checksum(&active).unwrap(), before);
    let _ = fs::remove_dir_all(&root);
}
