//
// Copyright (c) The Vireo Contributors
//
// SPDX-License-Identifier: MIT
//

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use vireo_datastore::Notification;
use vireo_utils::task::Task;
use yang3::data::DataFormat;

use crate::errors::escape_xml;
use crate::stream::EventStream;

const NETCONF_NOTIFICATION_NS: &str =
    "urn:ietf:params:xml:ns:netconf:notification:1.0";

/// Formats YANG's date-and-time (RFC 6991) with nanosecond precision and
/// the unknown-offset UTC designator.
pub fn yang_date_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.9f-00:00").to_string()
}

/// Wraps a serialized notification with the RESTCONF notification envelope
/// (RFC 8040, section 6.4).
pub fn as_restconf_notification(
    format: DataFormat,
    notification: &Notification,
) -> String {
    let event_time = yang_date_time(notification.time);
    match format {
        DataFormat::JSON => {
            let mut envelope = serde_json::Map::new();
            envelope.insert("eventTime".to_owned(), json!(event_time));
            if let Ok(serde_json::Value::Object(members)) =
                serde_json::from_str(&notification.json)
            {
                for (name, value) in members {
                    envelope.insert(name, value);
                }
            }
            json!({ "ietf-restconf:notification": envelope }).to_string()
        }
        _ => {
            format!(
                "<notification xmlns=\"{}\"><eventTime>{}</eventTime>{}</notification>",
                NETCONF_NOTIFICATION_NS,
                event_time,
                notification.xml.trim_end(),
            )
        }
    }
}

/// Builds the `subscription-terminated` notification for a dynamic
/// subscription the engine tore down.
pub fn subscription_terminated(
    format: DataFormat,
    time: DateTime<Utc>,
    id: u32,
    reason: &str,
) -> String {
    let event_time = yang_date_time(time);
    match format {
        DataFormat::JSON => json!({
            "ietf-restconf:notification": {
                "eventTime": event_time,
                "ietf-subscribed-notifications:subscription-terminated": {
                    "id": id,
                    "reason": reason,
                }
            }
        })
        .to_string(),
        _ => format!(
            "<notification xmlns=\"{}\"><eventTime>{}</eventTime>\
             <subscription-terminated \
             xmlns=\"urn:ietf:params:xml:ns:yang:ietf-subscribed-notifications\">\
             <id>{}</id><reason>{}</reason>\
             </subscription-terminated></notification>",
            NETCONF_NOTIFICATION_NS,
            event_time,
            id,
            escape_xml(reason),
        ),
    }
}

/// Feeds the engine's notification firehose into an event stream until
/// either side goes away. Used by the `/streams/NETCONF/{JSON,XML}`
/// endpoints.
pub fn relay_notifications(
    stream: &EventStream,
    mut notifications: broadcast::Receiver<std::sync::Arc<Notification>>,
    format: DataFormat,
) {
    let relay_stream = stream.clone();
    let task = Task::spawn(async move {
        loop {
            tokio::select! {
                event = notifications.recv() => match event {
                    Ok(notification) => {
                        relay_stream.enqueue(&as_restconf_notification(
                            format,
                            &notification,
                        ));
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(%missed, "slow notification stream client");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("notification source is gone");
                        relay_stream.terminate();
                        break;
                    }
                },
                _ = relay_stream.wait_closed() => break,
            }
        }
    });
    stream.hold_task(task);
}
