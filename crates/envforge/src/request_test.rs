// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0

use rstest::rstest;
use semver::Version;

use super::*;

#[rstest]
#[case("ripgrep", "ripgrep", None)]
#[case("python@>=3.11", "python", Some(">=3.11"))]
#[case("cmake >=3.26, <4", "cmake", Some(">=3.26, <4"))]
#[case("  nodejs@^20  ", "nodejs", Some("^20"))]
fn test_parse_request(#[case] input: &str, #[case] name: &str, #[case] req: Option<&str>) {
    let request: PackageRequest = input.parse().expect("Should parse request");
    assert_eq!(request.name, name);
    assert_eq!(
        request.constraint,
        req.map(|r| VersionReq::parse(r).unwrap())
    );
}

#[rstest]
#[case("")]
#[case("@1.0")]
#[case("python@")]
#[case("python@not-a-version")]
#[case("py/thon")]
fn test_parse_invalid_request(#[case] input: &str) {
    let result = input.parse::<PackageRequest>();
    assert!(
        matches!(result, Err(Error::InvalidRequest { .. })),
        "Expected InvalidRequest for {input:?}, got {result:?}"
    );
}

#[rstest]
fn test_matches() {
    let request: PackageRequest = "python@>=3.11".parse().unwrap();
    assert!(request.matches(&Version::new(3, 12, 0)));
    assert!(!request.matches(&Version::new(3, 10, 4)));

    let any = PackageRequest::new("python");
    assert!(any.matches(&Version::new(0, 0, 1)));
    assert_eq!(any.constraint_string(), "*");
}

#[rstest]
fn test_exact_request() {
    let version = Version::new(1, 2, 3);
    let request = PackageRequest::exact("zlib", &version);
    assert!(request.matches(&version));
    assert!(!request.matches(&Version::new(1, 2, 4)));
    assert_eq!(request.to_string(), "zlib@=1.2.3");
}

#[rstest]
fn test_requests_in_yaml() {
    let yaml = "- ripgrep\n- python@>=3.11\n";
    let requests: Vec<PackageRequest> = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], PackageRequest::new("ripgrep"));
    assert_eq!(requests[1].name, "python");

    let bad: std::result::Result<Vec<PackageRequest>, _> = serde_yaml::from_str("- '@1'\n");
    assert!(bad.is_err());
}
