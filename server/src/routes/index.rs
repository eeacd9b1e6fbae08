//! Landing page.

use axum::response::Html;

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
    <body>
        <script>
            const ws = new WebSocket(`ws://${location.host}/ws`);
            ws.onopen = function () { console.log("Connected"); }
            ws.onmessage = function (messageEvent) { console.log(messageEvent.data); }
        </script>
        <script>
            const eventSource = new EventSource("/events");
            const eventList = document.createElement("ol");
            document.body.appendChild(eventList);
            eventSource.addEventListener("notification", function (e) {
                const element = document.createElement("li");
                element.textContent = "Message: " + e.data;
                eventList.appendChild(element);
            });
        </script>
    </body>
</html>
"#;

/// `GET /` — demo page that subscribes to `/ws` and `/events`.
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}
