use axum::{Router, extract::State, http::header, response::IntoResponse, routing::get};

use crate::counter::CounterService;

pub fn router(counter: CounterService) -> Router {
    Router::new().route("/", get(handle_count)).with_state(counter)
}

// Counting the request and reporting the total is one operation: the
// response already includes this very call.
async fn handle_count(State(counter): State<CounterService>) -> impl IntoResponse {
    let total = counter.new_request();

    ([(header::CONTENT_TYPE, "text/plain")], format!("{total}\n"))
}
