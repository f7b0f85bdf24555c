//! Integration tests for the appointment service probe against a mock server.

use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate};
use mockito::{Matcher, Mock, ServerGuard};
use reqwest::Client;
use slotwatch_core::{
    model::{Dose, SearchGroup},
    ports::{AvailabilityProbe, CodeRequest, ProbeError},
};
use slotwatch_provider_its::ItsProbe;

const CODE: &str = "ABCD-1234-EFGH";
// 2021-06-15T09:00:00Z and 2021-07-13T09:00:00Z
const FIRST_BEGIN: i64 = 1_623_747_600_000;
const SECOND_BEGIN: i64 = 1_626_166_800_000;

async fn directory(server: &mut ServerGuard) -> Mock {
    let body = format!(
        r#"{{"Baden-Württemberg": [{{"PLZ": "68163", "URL": "{}/", "Zentrumsname": "Maimarkthalle"}}]}}"#,
        server.url()
    );
    server
        .mock("GET", "/impfzentren.json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .create_async()
        .await
}

fn probe(server: &ServerGuard) -> ItsProbe {
    ItsProbe::with_directory_url(Client::new(), format!("{}/impfzentren.json", server.url()))
}

fn group() -> SearchGroup {
    SearchGroup::new(CODE, ["68163"])
}

fn search_mock(server: &mut ServerGuard) -> mockito::Mock {
    server
        .mock("GET", "/rest/suche/impfterminsuche")
        .match_query(Matcher::UrlEncoded("plz".into(), "68163".into()))
        .match_header("authorization", Matcher::Regex("^Basic ".into()))
}

fn local(millis: i64) -> chrono::NaiveDateTime {
    DateTime::from_timestamp_millis(millis)
        .expect("valid timestamp")
        .with_timezone(&Local)
        .naive_local()
}

#[tokio::test]
async fn pairs_are_split_by_dose_with_one_request() {
    let mut server = mockito::Server::new_async().await;
    let _directory = directory(&mut server).await;
    let search = search_mock(&mut server)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!(
            r#"{{"termine": [[{{"slotId": "a", "begin": {FIRST_BEGIN}}}, {{"slotId": "b", "begin": {SECOND_BEGIN}}}]], "termineTSS": []}}"#
        ))
        .expect(1)
        .create_async()
        .await;
    let probe = probe(&server);

    let first = probe.check_availability(&group(), Dose::First).await.expect("first dose");
    let second = probe.check_availability(&group(), Dose::Second).await.expect("second dose");

    search.assert_async().await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].dose, Dose::First);
    assert_eq!(first[0].starts_at(), local(FIRST_BEGIN));
    assert_eq!(first[0].group, group().id());
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].dose, Dose::Second);
    assert_eq!(second[0].starts_at(), local(SECOND_BEGIN));
}

#[tokio::test]
async fn empty_result_is_ok() {
    let mut server = mockito::Server::new_async().await;
    let _directory = directory(&mut server).await;
    let _search = search_mock(&mut server)
        .with_status(200)
        .with_body(r#"{"termine": [], "termineTSS": [], "praxen": {}}"#)
        .create_async()
        .await;

    let slots = probe(&server)
        .check_availability(&group(), Dose::First)
        .await
        .expect("empty search");

    assert!(slots.is_empty());
}

#[tokio::test]
async fn unauthorized_means_invalid_code() {
    let mut server = mockito::Server::new_async().await;
    let _directory = directory(&mut server).await;
    let _search = search_mock(&mut server).with_status(401).create_async().await;

    let err = probe(&server)
        .check_availability(&group(), Dose::First)
        .await
        .expect_err("rejected code");

    assert!(matches!(err, ProbeError::Auth(_)), "{err:?}");
}

#[tokio::test]
async fn too_many_requests_carries_retry_hint() {
    let mut server = mockito::Server::new_async().await;
    let _directory = directory(&mut server).await;
    let _search = search_mock(&mut server)
        .with_status(429)
        .with_header("retry-after", "120")
        .create_async()
        .await;

    let err = probe(&server)
        .check_availability(&group(), Dose::First)
        .await
        .expect_err("rate limited");

    assert!(
        matches!(err, ProbeError::RateLimited { retry_after: Some(delay) } if delay == Duration::from_secs(120)),
        "{err:?}"
    );
}

#[tokio::test]
async fn server_errors_are_transient() {
    let mut server = mockito::Server::new_async().await;
    let _directory = directory(&mut server).await;
    let _search = search_mock(&mut server).with_status(503).create_async().await;

    let err = probe(&server)
        .check_availability(&group(), Dose::First)
        .await
        .expect_err("unavailable");

    assert!(matches!(err, ProbeError::Transient(_)), "{err:?}");
}

#[tokio::test]
async fn unexpected_client_errors_are_transient() {
    for status in [400, 404, 410] {
        let mut server = mockito::Server::new_async().await;
        let _directory = directory(&mut server).await;
        let _search = search_mock(&mut server)
            .with_status(status)
            .with_body("<html>Wartungsarbeiten</html>")
            .create_async()
            .await;

        let err = probe(&server)
            .check_availability(&group(), Dose::First)
            .await
            .expect_err("error status");

        assert!(matches!(err, ProbeError::Transient(_)), "{status}: {err:?}");
    }
}

#[tokio::test]
async fn unreadable_payload_is_fatal() {
    let mut server = mockito::Server::new_async().await;
    let _directory = directory(&mut server).await;
    let _search = search_mock(&mut server)
        .with_status(200)
        .with_body("<html>maintenance</html>")
        .create_async()
        .await;

    let err = probe(&server)
        .check_availability(&group(), Dose::First)
        .await
        .expect_err("html instead of json");

    assert!(matches!(err, ProbeError::Fatal(_)), "{err:?}");
}

#[tokio::test]
async fn unknown_center_is_fatal() {
    let mut server = mockito::Server::new_async().await;
    let _directory = directory(&mut server).await;

    let err = probe(&server)
        .check_availability(&SearchGroup::new(CODE, ["10115"]), Dose::First)
        .await
        .expect_err("no such center");

    assert!(matches!(err, ProbeError::Fatal(_)), "{err:?}");
}

fn code_request() -> CodeRequest {
    CodeRequest {
        postal_code: "68163".to_owned(),
        birth_date: NaiveDate::from_ymd_opt(1982, 3, 2).expect("valid date"),
        phone: "+491761234567".to_owned(),
        email: "erika@example.org".to_owned(),
    }
}

#[tokio::test]
async fn code_request_posts_contact_data() {
    let mut server = mockito::Server::new_async().await;
    let _directory = directory(&mut server).await;
    let request = server
        .mock("POST", "/rest/smspin/anforderung")
        .match_body(Matcher::PartialJsonString(
            r#"{"plz": "68163", "phone": "+491761234567", "email": "erika@example.org", "birthday": "1982-03-02"}"#
                .to_owned(),
        ))
        .with_status(200)
        .create_async()
        .await;

    let sent = probe(&server)
        .request_registration_code(&code_request())
        .await
        .expect("request accepted");

    assert!(sent);
    request.assert_async().await;
}

#[tokio::test]
async fn rejected_code_request_returns_false() {
    let mut server = mockito::Server::new_async().await;
    let _directory = directory(&mut server).await;
    let _request = server
        .mock("POST", "/rest/smspin/anforderung")
        .with_status(400)
        .with_body("registration closed")
        .create_async()
        .await;

    let sent = probe(&server)
        .request_registration_code(&code_request())
        .await
        .expect("answered");

    assert!(!sent);
}
