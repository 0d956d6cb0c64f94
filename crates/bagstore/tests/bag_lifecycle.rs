use std::fs;

use bagstore::{Bag, BagError, BagOptions};
use serde_yaml::Value;

fn options(dir: &tempfile::TempDir) -> BagOptions {
    BagOptions::new().with_directory(dir.path())
}

#[test]
fn second_writer_is_rejected_until_it_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = Bag::open("shared", options(&dir)).unwrap();
    let mut second = Bag::open("shared", options(&dir)).unwrap();
    assert_eq!(first.fingerprint(), second.fingerprint());

    first.set("owner", "first").unwrap();
    first.save().unwrap();
    let on_disk = fs::read_to_string(first.path()).unwrap();

    second.set("owner", "second").unwrap();
    let err = second.save().unwrap_err();
    match &err {
        BagError::Conflict {
            expected, found, ..
        } => {
            assert_eq!(expected, second.fingerprint());
            assert_eq!(found, first.fingerprint());
        }
        other => panic!("expected conflict, got {other}"),
    }
    assert_eq!(fs::read_to_string(second.path()).unwrap(), on_disk);
    assert!(second.is_dirty());
    assert_eq!(second.get("owner"), Some(&Value::from("second")));

    second.reload().unwrap();
    assert_eq!(second.get("owner"), Some(&Value::from("first")));
    second.set("owner", "second").unwrap();
    second.save().unwrap();

    let reopened = Bag::open("shared", options(&dir)).unwrap();
    assert_eq!(reopened.get("owner"), Some(&Value::from("second")));
    assert!(first.save().is_ok(), "clean save never conflicts");
}

#[test]
fn fresh_bag_round_trips_empty() {
    let dir = tempfile::tempdir().unwrap();
    let bag = Bag::open("empty", options(&dir)).unwrap();
    assert!(bag.is_empty());
    assert!(!bag.is_dirty());

    let reopened = Bag::open("empty", options(&dir)).unwrap();
    assert_eq!(reopened.fingerprint(), bag.fingerprint());
}

#[test]
fn meta_changes_are_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let mut bag = Bag::open("meta", options(&dir)).unwrap();

    fs::write(bag.path(), "meta: {rotated: true}\ndata: {}\n").unwrap();
    bag.set("k", "v").unwrap();
    assert!(bag.save().unwrap_err().is_conflict());
}
