use salvo::prelude::*;
use serde_json::json;

use crate::web::web_state;

#[handler]
pub async fn health(res: &mut Response) {
    let state = web_state();

    let payload = json!({
        "bridge": {
            "status": "running",
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "version": env!("CARGO_PKG_VERSION"),
            "active_lanes": state.bridge.active_lanes(),
            "store": format!("{:?}", state.bridge.db().db_type()).to_lowercase(),
        }
    });

    res.render(Json(payload));
}
