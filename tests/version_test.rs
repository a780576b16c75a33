//! Version selection properties.

use basalt::minecraft::version::{fallback_version, is_supported, select, SUPPORTED, VERSIONS};

#[test]
fn selection_is_monotone() {
    let lowest_floor = VERSIONS[0].floor;
    for advertised in 0..=600 {
        let selected = select(advertised);
        if advertised >= lowest_floor {
            // the pick never exceeds the advertised version...
            assert!(
                selected.floor <= advertised,
                "selected floor {} for advertised {}",
                selected.floor,
                advertised
            );
            // ...and no other descriptor fits more tightly
            for other in VERSIONS {
                assert!(
                    other.floor > advertised || other.floor <= selected.floor,
                    "descriptor with floor {} beats pick {} for advertised {}",
                    other.floor,
                    selected.floor,
                    advertised
                );
            }
        } else {
            // below the table, the oldest descriptor is the fallback
            assert_eq!(selected.floor, lowest_floor);
        }
    }
}

#[test]
fn every_supported_version_resolves() {
    for &version in SUPPORTED {
        let selected = select(version);
        assert!(selected.floor <= version);
        assert!(is_supported(version));
    }
}

#[test]
fn fallback_is_newest_supported() {
    let fallback = fallback_version();
    assert!(is_supported(fallback));
    assert!(SUPPORTED.iter().all(|&version| version <= fallback));
}

#[test]
fn unsupported_versions_are_rejected() {
    for version in [0, 1, 2, 3, 46, 48, 106, 339, 9999] {
        assert!(!is_supported(version), "{} should not be supported", version);
    }
}
