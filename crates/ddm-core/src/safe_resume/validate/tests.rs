//! Tests for safe-resume validation.

use crate::fetch_head::HeadResult;

use super::{validate_for_resume, StoredMetadata, ValidationErrorKind};

fn head_result(
    content_length: Option<u64>,
    etag: Option<&str>,
    last_modified: Option<&str>,
) -> HeadResult {
    HeadResult {
        content_length,
        accept_ranges: true,
        etag: etag.map(String::from),
        last_modified: last_modified.map(String::from),
        content_disposition: None,
    }
}

#[test]
fn no_stored_metadata_ok() {
    let stored = StoredMetadata {
        total_size: None,
        etag: None,
        last_modified: None,
    };
    let head = head_result(
        Some(1000),
        Some("e1"),
        Some("Wed, 21 Oct 2015 07:28:00 GMT"),
    );
    assert!(validate_for_resume(stored, &head).is_ok());
}

#[test]
fn same_etag_and_size_ok() {
    let stored = StoredMetadata {
        total_size: Some(1000),
        etag: Some("e1"),
        last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT"),
    };
    let head = head_result(
        Some(1000),
        Some("e1"),
        Some("Wed, 21 Oct 2015 07:28:00 GMT"),
    );
    assert!(validate_for_resume(stored, &head).is_ok());
}

#[test]
fn etag_changed_err() {
    let stored = StoredMetadata {
        total_size: Some(1000),
        etag: Some("e1"),
        last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT"),
    };
    let head = head_result(
        Some(1000),
        Some("e2"),
        Some("Wed, 21 Oct 2015 07:28:00 GMT"),
    );
    let r = validate_for_resume(stored, &head);
    assert!(r.is_err());
    let e = r.unwrap_err();
    assert!(matches!(
        e.kind,
        ValidationErrorKind::RemoteChanged {
            etag_changed: true,
            ..
        }
    ));
}

#[test]
fn size_changed_err() {
    let stored = StoredMetadata {
        total_size: Some(1000),
        etag: Some("e1"),
        last_modified: None,
    };
    let head = head_result(Some(2000), Some("e1"), None);
    let r = validate_for_resume(stored, &head);
    assert!(r.is_err());
    let e = r.unwrap_err();
    assert!(matches!(
        e.kind,
        ValidationErrorKind::RemoteChanged {
            size_changed: true,
            ..
        }
    ));
}

#[test]
fn last_modified_changed_err() {
    let stored = StoredMetadata {
        total_size: Some(1000),
        etag: None,
        last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT"),
    };
    let head = head_result(Some(1000), None, Some("Thu, 22 Oct 2015 08:00:00 GMT"));
    let r = validate_for_resume(stored, &head);
    assert!(r.is_err());
    let e = r.unwrap_err();
    assert!(matches!(
        e.kind,
        ValidationErrorKind::RemoteChanged {
            last_modified_changed: true,
            ..
        }
    ));
}
