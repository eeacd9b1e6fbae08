//! Form echo endpoint.
//!
//! `POST /` decodes an `application/x-www-form-urlencoded` or
//! `multipart/form-data` body and renders the submitted fields back as an
//! HTML-escaped `<pre>` dump, one `name => value` per line. File parts show
//! their file name and size instead of their content.
//!
//! The body size cap is enforced by the router's `DefaultBodyLimit`, so an
//! oversized upload surfaces here as an extractor error carrying `413`.

use std::fmt::Write as _;

use axum::{
    extract::{FromRequest, Multipart, Request},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    Form,
};
use tracing::debug;

use crate::util::escape_html;

/// One decoded form part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    File { file_name: String, size: usize },
}

/// `POST /` — echo the submitted form fields.
pub async fn echo_form(request: Request) -> Response {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let fields = if is_multipart {
        read_multipart(request).await
    } else {
        read_urlencoded(request).await
    };

    match fields {
        Ok(fields) => {
            debug!(fields = fields.len(), "Form decoded");
            Html(render(&fields)).into_response()
        }
        Err((status, message)) => {
            debug!(%status, "Form rejected: {message}");
            (status, message).into_response()
        }
    }
}

type FormResult = Result<Vec<(String, FieldValue)>, (StatusCode, String)>;

async fn read_urlencoded(request: Request) -> FormResult {
    let Form(pairs) = Form::<Vec<(String, String)>>::from_request(request, &())
        .await
        .map_err(|e| (e.status(), e.body_text()))?;
    Ok(pairs
        .into_iter()
        .map(|(name, value)| (name, FieldValue::Text(value)))
        .collect())
}

async fn read_multipart(request: Request) -> FormResult {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| (e.status(), e.body_text()))?;

    let mut fields = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (e.status(), e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let value = match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let data = field.bytes().await.map_err(|e| (e.status(), e.body_text()))?;
                FieldValue::File {
                    file_name,
                    size: data.len(),
                }
            }
            None => FieldValue::Text(field.text().await.map_err(|e| (e.status(), e.body_text()))?),
        };
        fields.push((name, value));
    }
    Ok(fields)
}

fn render(fields: &[(String, FieldValue)]) -> String {
    let mut out = String::from("<!DOCTYPE html><html lang=\"en\"><body><pre>");
    for (name, value) in fields {
        let name = escape_html(name);
        let _ = match value {
            FieldValue::Text(text) => writeln!(out, "{name} => {}", escape_html(text)),
            FieldValue::File { file_name, size } => writeln!(
                out,
                "{name} => {} ({size} bytes)",
                escape_html(file_name)
            ),
        };
    }
    out.push_str("</pre></body></html>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        extract::DefaultBodyLimit,
        routing::post,
        Router,
    };
    use tower::ServiceExt;

    const BOUNDARY: &str = "pushgate-test-boundary";

    fn router(limit: usize) -> Router {
        Router::new()
            .route("/", post(echo_form))
            .layer(DefaultBodyLimit::max(limit))
    }

    async fn submit(router: Router, content_type: &str, body: Vec<u8>) -> (StatusCode, String) {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, file_name, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match file_name {
                Some(f) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    #[tokio::test]
    async fn test_urlencoded_fields_are_echoed_escaped() {
        let (status, body) = submit(
            router(1024),
            "application/x-www-form-urlencoded",
            b"test=Hello%2C+World%21&tag=%3Cb%3E".to_vec(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<pre>test => Hello, World!\n"));
        assert!(body.contains("tag => &lt;b&gt;\n"));
        assert!(!body.contains("<b>"));
    }

    #[tokio::test]
    async fn test_multipart_text_and_file_parts() {
        let body = multipart_body(&[
            ("test", None, b"Hello, World!"),
            ("upload", Some("notes.txt"), b"0123456789"),
        ]);
        let (status, body) = submit(
            router(1024),
            &format!("multipart/form-data; boundary={BOUNDARY}"),
            body,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("test => Hello, World!"));
        assert!(body.contains("upload => notes.txt (10 bytes)"));
        assert!(!body.contains("0123456789"));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected_with_413() {
        let big = vec![b'x'; 4096];
        let body = multipart_body(&[("blob", Some("big.bin"), &big)]);
        let (status, _) = submit(
            router(1024),
            &format!("multipart/form-data; boundary={BOUNDARY}"),
            body,
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        let mut form = b"field=".to_vec();
        form.extend(std::iter::repeat(b'y').take(4096));
        let (status, _) = submit(router(1024), "application/x-www-form-urlencoded", form).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_render_empty_form() {
        assert_eq!(
            render(&[]),
            "<!DOCTYPE html><html lang=\"en\"><body><pre></pre></body></html>"
        );
    }
}
