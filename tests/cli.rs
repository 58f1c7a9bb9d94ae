//! End-to-end tests, run against a local stub geocoding server.

use std::collections::HashMap;
use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use cli_test_dir::*;
use serde_json::{json, Value};

/// Fake Nominatim `/search`. Knows about Paris, and nothing else.
async fn nominatim_search(
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    let q = params.get("q").cloned().unwrap_or_default();
    let is_paris = q.starts_with("Paris");
    if params.get("format").map(|f| &f[..]) == Some("geojson") {
        // This is what the `geocoding` crate asks for.
        let features = if is_paris {
            json!([{
                "type": "Feature",
                "properties": {
                    "place_id": 88066702,
                    "osm_type": "relation",
                    "osm_id": 7444,
                    "place_rank": 15,
                    "category": "boundary",
                    "type": "administrative",
                    "importance": 0.88,
                    "display_name": "Paris, Île-de-France, France"
                },
                "bbox": [2.224122, 48.8155755, 2.4697602, 48.902156],
                "geometry": { "type": "Point", "coordinates": [2.3522, 48.8566] }
            }])
        } else {
            json!([])
        };
        return (
            StatusCode::OK,
            Json(json!({
                "type": "FeatureCollection",
                "licence": "ODbL",
                "features": features
            })),
        );
    }

    // Nominatim's usage policy requires an identifying user agent.
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|ua| ua.to_str().ok())
        .unwrap_or("");
    if !user_agent.starts_with("geocode-places/") {
        return (StatusCode::FORBIDDEN, Json(json!({ "error": "no user agent" })));
    }
    if is_paris {
        (
            StatusCode::OK,
            Json(json!([{
                "place_id": 88066702,
                "display_name": "Paris, France",
                "lat": "48.8566",
                "lon": "2.3522"
            }])),
        )
    } else {
        (StatusCode::OK, Json(json!([])))
    }
}

/// Fake Google `/json`. Only accepts the key `test-key`.
async fn google_json(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    if params.get("key").map(|k| &k[..]) != Some("test-key") {
        return Json(json!({
            "status": "REQUEST_DENIED",
            "error_message": "The provided API key is invalid.",
            "results": []
        }));
    }
    let address = params.get("address").cloned().unwrap_or_default();
    if address.starts_with("Paris") {
        Json(json!({
            "status": "OK",
            "results": [{
                "formatted_address": "Paris, France",
                "geometry": { "location": { "lat": 48.856614, "lng": 2.3522219 } }
            }]
        }))
    } else {
        Json(json!({ "status": "ZERO_RESULTS", "results": [] }))
    }
}

/// A server which never answers in time.
async fn slow_search() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(30)).await;
    Json(json!([]))
}

/// How many requests are running at `/counted/search`.
#[derive(Debug, Default)]
struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

/// Decrements `InFlight::current`, even if the client hangs up.
struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn new(in_flight: Arc<InFlight>) -> InFlightGuard {
        let current = in_flight.current.fetch_add(1, Ordering::SeqCst) + 1;
        in_flight.max.fetch_max(current, Ordering::SeqCst);
        InFlightGuard(in_flight)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A slow `geocoding`-style search which counts overlapping requests.
async fn counted_search(State(in_flight): State<Arc<InFlight>>) -> Json<Value> {
    let _guard = InFlightGuard::new(in_flight);
    tokio::time::sleep(Duration::from_secs(3)).await;
    Json(json!({ "type": "FeatureCollection", "licence": "ODbL", "features": [] }))
}

/// Start our stub server on a background thread, and return its address.
fn start_stub_server() -> (SocketAddr, Arc<InFlight>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("could not bind stub server");
    let addr = listener.local_addr().expect("no local address");
    let in_flight = Arc::new(InFlight::default());
    let state = in_flight.clone();
    thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().expect("could not create runtime");
        runtime.block_on(async move {
            let app = Router::new()
                .route("/search", get(nominatim_search))
                .route("/json", get(google_json))
                .route("/slow/search", get(slow_search))
                .route("/counted/search", get(counted_search))
                .with_state(state);
            axum::Server::from_tcp(listener)
                .expect("could not use listener")
                .serve(app.into_make_service())
                .await
                .expect("stub server failed");
        });
    });
    (addr, in_flight)
}

fn read_output(testdir: &TestDir, name: &str) -> String {
    fs::read_to_string(testdir.path(name)).expect("could not read output")
}

#[test]
fn missing_input_file_fails_without_output() {
    let testdir = TestDir::new("geocode-places", "missing_input_file_fails_without_output");
    let output = testdir
        .cmd()
        .arg("does-not-exist.csv")
        .arg("--output=out.csv")
        .output()
        .expect_failure();
    assert!(output.stderr_str().contains("input file not found"));
    assert!(!testdir.path("out.csv").exists());
}

#[test]
fn google_without_api_key_fails_without_output() {
    let testdir =
        TestDir::new("geocode-places", "google_without_api_key_fails_without_output");
    testdir.create_file("places.csv", "Place,Country\nParis,France\n");
    let output = testdir
        .cmd()
        .env_remove("GOOGLE_MAPS_API_KEY")
        .arg("places.csv")
        .arg("--geocoder=google")
        .arg("--output=out.csv")
        .output()
        .expect_failure();
    assert!(output.stderr_str().contains("requires an API key"));
    assert!(!testdir.path("out.csv").exists());
}

#[test]
fn nominatim_csv() {
    let (addr, _) = start_stub_server();
    let testdir = TestDir::new("geocode-places", "nominatim_csv");
    testdir.create_file("places.csv", "Place,Country\nParis,France\n");
    testdir
        .cmd()
        .arg("places.csv")
        .arg(format!("--endpoint=http://{}/", addr))
        .output()
        .expect_success();
    assert_eq!(
        read_output(&testdir, "addresses_output.csv"),
        "Place,Country,Address,Latitude,Longitude\nParis,France,\"Paris, France\",48.8566,2.3522\n",
    );
}

#[test]
fn nominatim_text_with_failures_and_default_country() {
    let (addr, _) = start_stub_server();
    let testdir =
        TestDir::new("geocode-places", "nominatim_text_with_failures_and_default_country");
    testdir.create_file("places.txt", "Unknownplace,Nowhere\nParis\n");
    testdir
        .cmd()
        .arg("places.txt")
        .arg("-o")
        .arg("out.csv")
        .arg("-c")
        .arg("France")
        .arg("--errors=column")
        .arg("--geocoder=nominatim")
        .arg(format!("--endpoint=http://{}", addr))
        .output()
        .expect_success();
    assert_eq!(
        read_output(&testdir, "out.csv"),
        "Place,Country,Address,Latitude,Longitude,Error\n\
         Unknownplace,Nowhere,,,,\"address not found for Unknownplace, Nowhere\"\n\
         Paris,France,\"Paris, France\",48.8566,2.3522,\n",
    );
}

#[test]
fn google_api() {
    let (addr, _) = start_stub_server();
    let testdir = TestDir::new("geocode-places", "google_api");
    testdir.create_file("places.csv", "Store,Nation\nParis,France\nAtlantis,\n");
    testdir
        .cmd()
        .arg("places.csv")
        .arg("--geocoder=google")
        .arg("--api-key=test-key")
        .arg(format!("--endpoint=http://{}/", addr))
        .output()
        .expect_success();
    assert_eq!(
        read_output(&testdir, "addresses_output.csv"),
        "Place,Country,Address,Latitude,Longitude\n\
         Paris,France,\"Paris, France\",48.856614,2.3522219\n\
         Atlantis,,error geocoding Atlantis: geocoder returned status ZERO_RESULTS,,\n",
    );
}

#[test]
fn google_rejected_key_is_a_row_error() {
    let (addr, _) = start_stub_server();
    let testdir = TestDir::new("geocode-places", "google_rejected_key_is_a_row_error");
    testdir.create_file("places.csv", "Place,Country\nParis,France\n");
    testdir
        .cmd()
        .env("GOOGLE_MAPS_API_KEY", "wrong-key")
        .arg("places.csv")
        .arg("--geocoder=google")
        .arg(format!("--endpoint=http://{}/", addr))
        .output()
        .expect_success();
    let output = read_output(&testdir, "addresses_output.csv");
    assert!(output.contains("REQUEST_DENIED: The provided API key is invalid."));
    assert!(output.ends_with(",,\n"));
}

#[test]
fn osm_library() {
    let (addr, _) = start_stub_server();
    let testdir = TestDir::new("geocode-places", "osm_library");
    testdir.create_file("places.txt", "Paris,France\n");
    testdir
        .cmd()
        .arg("places.txt")
        .arg("--geocoder=osm-library")
        .arg(format!("--endpoint=http://{}/", addr))
        .output()
        .expect_success();
    assert_eq!(
        read_output(&testdir, "addresses_output.csv"),
        "Place,Country,Address,Latitude,Longitude\n\
         Paris,France,\"Paris, Île-de-France, France\",48.8566,2.3522\n",
    );
}

#[test]
fn timeouts_are_row_errors() {
    let (addr, _) = start_stub_server();
    let testdir = TestDir::new("geocode-places", "timeouts_are_row_errors");
    testdir.create_file("places.txt", "Paris,France\n");
    testdir
        .cmd()
        .arg("places.txt")
        .arg("--timeout=1")
        .arg(format!("--endpoint=http://{}/slow", addr))
        .output()
        .expect_success();
    assert_eq!(
        read_output(&testdir, "addresses_output.csv"),
        "Place,Country,Address,Latitude,Longitude\n\
         Paris,France,\"error geocoding Paris, France: request timed out after 1 seconds\",,\n",
    );
}

#[test]
fn osm_library_timeouts_never_overlap_requests() {
    let (addr, in_flight) = start_stub_server();
    let testdir =
        TestDir::new("geocode-places", "osm_library_timeouts_never_overlap_requests");
    testdir.create_file("places.txt", "Paris,France\nLyon,France\n");
    testdir
        .cmd()
        .arg("places.txt")
        .arg("--geocoder=osm-library")
        .arg("--timeout=1")
        .arg(format!("--endpoint=http://{}/counted/", addr))
        .output()
        .expect_success();
    assert_eq!(
        read_output(&testdir, "addresses_output.csv"),
        "Place,Country,Address,Latitude,Longitude\n\
         Paris,France,\"error geocoding Paris, France: request timed out after 1 seconds\",,\n\
         Lyon,France,\"error geocoding Lyon, France: request timed out after 1 seconds\",,\n",
    );
    assert_eq!(in_flight.max.load(Ordering::SeqCst), 1);
}

#[test]
fn zero_timeout_is_rejected() {
    let testdir = TestDir::new("geocode-places", "zero_timeout_is_rejected");
    testdir.create_file("places.csv", "Place,Country\nParis,France\n");
    testdir
        .cmd()
        .arg("places.csv")
        .arg("--timeout=0")
        .output()
        .expect_failure();
    assert!(!testdir.path("addresses_output.csv").exists());
}

#[test]
fn empty_input_writes_header_only() {
    let testdir = TestDir::new("geocode-places", "empty_input_writes_header_only");
    testdir.create_file("places.csv", "Place,Country\n");
    testdir
        .cmd()
        .arg("places.csv")
        .output()
        .expect_success();
    assert_eq!(
        read_output(&testdir, "addresses_output.csv"),
        "Place,Country,Address,Latitude,Longitude\n",
    );
}
