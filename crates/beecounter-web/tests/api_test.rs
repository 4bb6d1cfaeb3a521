//! Router tests driven in-process with `tower::ServiceExt::oneshot`.

mod common;

use std::time::Duration;

use axum::http::{header, StatusCode};
use beecounter_core::StreamMode;
use common::{body_bytes, body_json, location, session_cookie, GatedUploader, Options, TestApp};
use futures::StreamExt;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_capture_without_camera_is_503_json() {
    let app = TestApp::without_camera();
    let response = app.get("/capture", None).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("Camera not initialized"));
}

#[tokio::test]
async fn test_status_without_camera() {
    let app = TestApp::without_camera();
    let response = app.get("/status", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        serde_json::json!({"camera_initialized": false, "error": "Camera not available"})
    );
}

#[tokio::test]
async fn test_capture_serves_jpeg_and_releases_frame() {
    let app = TestApp::new();
    let response = app.get("/capture", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    let body = body_bytes(response).await;
    assert_eq!(&body[..2], &[0xFF, 0xD8]);

    let camera = app.camera.as_ref().unwrap();
    assert_eq!(camera.outstanding(), 0);
    assert_eq!(app.state.statistics.snapshot(0).captures, 1);
}

#[tokio::test]
async fn test_camera_settings_reflected_in_status() {
    let app = TestApp::new();
    let cookie = app.login().await;

    let response = app
        .post_form("/api/camera-settings", "resolution=VGA&quality=20", Some(&cookie))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let status = body_json(app.get("/status", None).await).await;
    assert_eq!(status["camera_initialized"], true);
    assert_eq!(status["quality"], 20);
    assert_eq!(status["width"], 640);
    assert_eq!(status["height"], 480);
}

#[tokio::test]
async fn test_camera_settings_requires_session() {
    let app = TestApp::new();
    let response = app
        .post_form("/api/camera-settings", "resolution=VGA&quality=20", None)
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_camera_settings_missing_param() {
    let app = TestApp::new();
    let cookie = app.login().await;
    let response = app
        .post_form("/api/camera-settings", "resolution=VGA", Some(&cookie))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let no_camera = TestApp::without_camera();
    let cookie = no_camera.login().await;
    let response = no_camera
        .post_form("/api/camera-settings", "resolution=VGA&quality=20", Some(&cookie))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_control_validates_values() {
    let app = TestApp::new();
    let cookie = app.login().await;

    let ok = app.get("/control?var=vflip&val=1", Some(&cookie)).await;
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(body_json(app.get("/status", None).await).await["vflip"], 1);

    let bad = app.get("/control?var=brightness&val=9", Some(&cookie)).await;
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    let unknown = app.get("/control?var=zoom&val=1", Some(&cookie)).await;
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_first_login_redirects_to_changepass() {
    let app = TestApp::new();
    let response = app
        .post_form("/login", "username=admin&password=admin", None)
        .await;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), Some("/changepass"));
    let cookie = session_cookie(&response).unwrap();
    assert!(cookie.starts_with("BEE_SESSION="));

    // Still on the factory password: the monitor page sends us back.
    let index = app.get("/", Some(&cookie)).await;
    assert_eq!(location(&index), Some("/login"));
}

#[tokio::test]
async fn test_change_password_then_monitor() {
    let app = TestApp::new();
    let cookie = app.login().await;

    let weak = app
        .post_form("/changepass", "new_password=short&confirm_password=short", Some(&cookie))
        .await;
    assert_eq!(weak.status(), StatusCode::BAD_REQUEST);

    let response = app
        .post_form(
            "/changepass",
            "new_password=Hive%231Bees&confirm_password=Hive%231Bees",
            Some(&cookie),
        )
        .await;
    assert_eq!(location(&response), Some("/"));

    let index = app.get("/", Some(&cookie)).await;
    assert_eq!(index.status(), StatusCode::OK);

    let relogin = app
        .post_form("/login", "username=admin&password=Hive%231Bees", None)
        .await;
    assert_eq!(location(&relogin), Some("/"));
}

#[tokio::test]
async fn test_lockout_after_five_failures() {
    let app = TestApp::new();
    for _ in 0..5 {
        let response = app
            .post_form("/login", "username=admin&password=wrong", None)
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let locked = app
        .post_form("/login", "username=admin&password=admin", None)
        .await;
    assert_eq!(locked.status(), StatusCode::TOO_MANY_REQUESTS);

    app.clock.advance_ms(5 * 60 * 1000 + 1);
    let response = app
        .post_form("/login", "username=admin&password=admin", None)
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn test_api_requires_session() {
    let app = TestApp::new();
    for uri in ["/api/capture/start", "/api/capture/stop", "/api/capture/photo"] {
        let response = app.post_form(uri, "", None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);
    }
    let response = app.get("/api/images", None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let page = app.get("/admin", None).await;
    assert_eq!(location(&page), Some("/login"));
}

#[tokio::test]
async fn test_protected_live_view() {
    let app = TestApp::with(Options {
        protect_live_view: true,
        ..Default::default()
    });
    assert_eq!(app.get("/capture", None).await.status(), StatusCode::UNAUTHORIZED);

    let cookie = app.login().await;
    assert_eq!(app.get("/capture", Some(&cookie)).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_collection_start_stop() {
    let app = TestApp::new();
    let cookie = app.login().await;
    let mut events = app.state.events.subscribe();

    let started = body_json(app.post_form("/api/capture/start", "", Some(&cookie)).await).await;
    assert_eq!(started["collection"]["active"], true);
    assert_eq!(events.recv().await.unwrap().name(), "collection_status");

    let stopped = body_json(app.post_form("/api/capture/stop", "", Some(&cookie)).await).await;
    assert_eq!(stopped["collection"]["active"], false);
}

#[tokio::test]
async fn test_photo_list_serve_delete() {
    let app = TestApp::new();
    let cookie = app.login().await;

    let photo = app.post_form("/api/capture/photo", "", Some(&cookie)).await;
    assert_eq!(photo.status(), StatusCode::OK);
    let photo = body_json(photo).await;
    assert_eq!(photo["image"]["name"], "img-1700000000.jpg");

    let list = body_json(app.get("/api/images", Some(&cookie)).await).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["path"], "/images/img-1700000000.jpg");

    let served = app.get("/images?serve=img-1700000000.jpg", Some(&cookie)).await;
    assert_eq!(served.status(), StatusCode::OK);
    assert_eq!(&body_bytes(served).await[..2], &[0xFF, 0xD8]);

    let traversal = app.get("/images?serve=..%2Fprefs.json", Some(&cookie)).await;
    assert_eq!(traversal.status(), StatusCode::BAD_REQUEST);

    let deleted = app.get("/images?delete=img-1700000000.jpg", Some(&cookie)).await;
    assert_eq!(deleted.status(), StatusCode::OK);
    let missing = app.get("/images?serve=img-1700000000.jpg", Some(&cookie)).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let neither = app.get("/images", Some(&cookie)).await;
    assert_eq!(neither.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_photo_capture_failure() {
    let app = TestApp::new();
    let cookie = app.login().await;
    app.camera.as_ref().unwrap().fail_next_acquisitions(1);

    let response = app.post_form("/api/capture/photo", "", Some(&cookie)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_json(response).await["error"]
        .as_str()
        .unwrap()
        .contains("Camera capture failed"));
}

#[tokio::test]
async fn test_polling_stream_headers() {
    let app = TestApp::with(Options {
        stream_mode: StreamMode::Polling,
        ..Default::default()
    });
    let response = app.get("/stream", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CACHE_CONTROL],
        "no-cache, no-store, must-revalidate"
    );
    let length: usize = response.headers()[header::CONTENT_LENGTH]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(body_bytes(response).await.len(), length);
}

#[tokio::test]
async fn test_multipart_stream_until_disconnect() {
    let app = TestApp::new();
    let response = app.get("/stream", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("multipart/x-mixed-replace"));

    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains("Content-Type: image/jpeg"));
    drop(body);

    // The capture thread notices the closed channel on its next write.
    let camera = app.camera.as_ref().unwrap();
    for _ in 0..100 {
        if app.state.statistics.snapshot(0).active_streams == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(app.state.statistics.snapshot(0).active_streams, 0);
    assert_eq!(camera.outstanding(), 0);
    assert_eq!(camera.double_releases(), 0);
}

#[tokio::test]
async fn test_refresh_rate_bounds() {
    let app = TestApp::new();
    let cookie = app.login().await;

    let ok = app.post_form("/api/set-refresh-rate", "rate=1000", Some(&cookie)).await;
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(app.state.device.refresh_rate().get(), 1000);

    let low = app.post_form("/api/set-refresh-rate", "rate=10", Some(&cookie)).await;
    assert_eq!(low.status(), StatusCode::BAD_REQUEST);
    let missing = app.post_form("/api/set-refresh-rate", "", Some(&cookie)).await;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_edge_impulse_upload() {
    let app = TestApp::new();
    let cookie = app.login().await;

    let no_key = app.post_form("/api/edgeimpulse/upload", "ei-label=bee", Some(&cookie)).await;
    assert_eq!(no_key.status(), StatusCode::BAD_REQUEST);

    let saved = app
        .post_form("/api/edgeimpulse/settings", "ei-api-key=ei_test", Some(&cookie))
        .await;
    assert_eq!(saved.status(), StatusCode::OK);

    app.post_form("/api/capture/photo", "", Some(&cookie)).await;
    let mut events = app.state.events.subscribe();
    let started = app.post_form("/api/edgeimpulse/upload", "ei-label=bee", Some(&cookie)).await;
    assert_eq!(started.status(), StatusCode::OK);

    let mut last = None;
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
        let payload = event.payload_json();
        last = Some(payload.clone());
        if payload.contains("complete") || payload.contains("failed") {
            break;
        }
    }
    assert!(last.unwrap().contains(r#""state":"complete""#));
    assert_eq!(
        *app.uploader.uploaded.lock().unwrap(),
        vec![("img-1700000000.jpg".to_string(), "bee".to_string())]
    );
}

#[tokio::test]
async fn test_second_upload_is_rejected_while_busy() {
    let app = TestApp::with(Options {
        uploader: GatedUploader::with_permits(0),
        ..Default::default()
    });
    let cookie = app.login().await;
    app.post_form("/api/edgeimpulse/settings", "ei-api-key=ei_test", Some(&cookie))
        .await;
    app.post_form("/api/capture/photo", "", Some(&cookie)).await;

    let first = app.post_form("/api/edgeimpulse/upload", "ei-label=bee", Some(&cookie)).await;
    assert_eq!(first.status(), StatusCode::OK);
    let second = app.post_form("/api/edgeimpulse/upload", "ei-label=bee", Some(&cookie)).await;
    assert_eq!(second.status(), StatusCode::CONFLICT);

    app.uploader.permits.add_permits(1);
    for _ in 0..100 {
        if !app.state.uploads.is_busy() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!app.state.uploads.is_busy());
}

#[tokio::test]
async fn test_download_model_not_supported() {
    let app = TestApp::new();
    let cookie = app.login().await;
    let response = app
        .post_form("/api/edgeimpulse/download-model", "", Some(&cookie))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_admin_password_change_errors_redirect() {
    let app = TestApp::new();
    let cookie = app.login().await;

    let wrong = app
        .post_form(
            "/admin/changepass",
            "current_password=nope&new_password=Hive%231Bees&confirm_password=Hive%231Bees",
            Some(&cookie),
        )
        .await;
    assert_eq!(location(&wrong), Some("/admin?error=Incorrect%20current%20password"));

    let ok = app
        .post_form(
            "/admin/changepass",
            "current_password=admin&new_password=Hive%231Bees&confirm_password=Hive%231Bees",
            Some(&cookie),
        )
        .await;
    assert_eq!(location(&ok), Some("/admin?success=1"));
}

#[tokio::test]
async fn test_factory_reset_restarts_and_logs_out() {
    let app = TestApp::new();
    let cookie = app.login().await;

    let response = app.post_form("/factory-reset", "", Some(&cookie)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        *app.system.reasons.lock().unwrap(),
        vec!["factory reset".to_string()]
    );
    assert_eq!(
        app.get("/api/images", Some(&cookie)).await.status(),
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn test_logout_clears_cookie() {
    let app = TestApp::new();
    let cookie = app.login().await;

    let response = app.get("/logout", Some(&cookie)).await;
    assert_eq!(location(&response), Some("/login"));
    assert!(response.headers()[header::SET_COOKIE]
        .to_str()
        .unwrap()
        .contains("Expires=Thu, 01 Jan 1970"));
    assert_eq!(
        app.get("/api/images", Some(&cookie)).await.status(),
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn test_anonymous_logout_keeps_owner_session() {
    let app = TestApp::new();
    let cookie = app.login().await;

    let response = app.get("/logout", None).await;
    assert_eq!(location(&response), Some("/login"));
    assert!(response.headers()[header::SET_COOKIE]
        .to_str()
        .unwrap()
        .contains("Expires=Thu, 01 Jan 1970"));

    assert_eq!(app.get("/api/images", Some(&cookie)).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_index_redirects_until_password_changed() {
    let app = TestApp::new();
    let cookie = app.login().await;

    let response = app.get("/", Some(&cookie)).await;
    assert_eq!(location(&response), Some("/login"));
}

#[tokio::test]
async fn test_admin_settings_persist() {
    let app = TestApp::new();
    let cookie = app.login().await;

    let response = app.post_form("/admin/timezone", "timezone=UTC0", Some(&cookie)).await;
    assert_eq!(location(&response), Some("/admin?tz_success=1"));
    assert_eq!(app.state.device.timezone().unwrap(), "UTC0");

    let response = app
        .post_form("/admin/timezone", "timezone=Europe+Berlin", Some(&cookie))
        .await;
    assert_eq!(location(&response), Some("/admin?tz_error=1"));
    assert_eq!(app.state.device.timezone().unwrap(), "UTC0");

    let response = app
        .post_form("/admin/device-name", "device_name=Hive+7", Some(&cookie))
        .await;
    assert_eq!(location(&response), Some("/admin?name_success=1"));
    assert_eq!(app.state.device.device_name().unwrap(), "Hive 7");
}
