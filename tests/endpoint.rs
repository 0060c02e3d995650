use anyhow::Result;
use qpio::endpoint::{Endpoint, Family};
use std::net::Ipv4Addr;

#[test]
fn v4_endpoint_roundtrips_through_text() -> Result<()> {
    let endpoint: Endpoint = "10.0.0.1:4791".parse()?;
    assert_eq!(endpoint.family(), Family::V4);
    assert_eq!(endpoint.port(), 4791);
    assert_eq!(endpoint.to_string(), "10.0.0.1:4791");
    Ok(())
}

#[test]
fn v6_endpoint_roundtrips_through_text() -> Result<()> {
    let endpoint: Endpoint = "[fe80::1]:4791".parse()?;
    assert_eq!(endpoint.family(), Family::V6);
    assert_eq!(endpoint.port(), 4791);
    Ok(())
}

#[test]
fn rejects_garbage_text() {
    assert!("not-an-endpoint".parse::<Endpoint>().is_err());
}

#[test]
fn constructors_agree_with_parsed_text() -> Result<()> {
    let from_parts = Endpoint::v4(Ipv4Addr::new(127, 0, 0, 1), 9000);
    let from_text: Endpoint = "127.0.0.1:9000".parse()?;
    assert_eq!(from_parts, from_text);
    Ok(())
}
