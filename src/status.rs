use serde::Serialize;

use crate::config::PublicAppConfig;
use crate::notify::NotificationPermission;

#[derive(Debug, Serialize)]
pub struct PipelineStatus {
    pub db_path: Option<String>,
    pub db_bootstrap_recovered: bool,
    pub tracking_active: bool,
    pub geolocation_denied: bool,
    pub candidate_area: Option<String>,
    pub popup_visible: bool,
    pub notifications_enabled: bool,
    pub notification_permission: NotificationPermission,
    pub last_shown_reminder_id: Option<i64>,
    pub telemetry_buffer_path: Option<String>,
    pub telemetry_queue_depth: usize,
    pub config: PublicAppConfig,
}

impl PipelineStatus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_path: Option<String>,
        db_bootstrap_recovered: bool,
        tracking_active: bool,
        geolocation_denied: bool,
        candidate_area: Option<String>,
        popup_visible: bool,
        notifications_enabled: bool,
        notification_permission: NotificationPermission,
        last_shown_reminder_id: Option<i64>,
        telemetry_buffer_path: Option<String>,
        telemetry_queue_depth: usize,
        config: PublicAppConfig,
    ) -> Self {
        Self {
            db_path,
            db_bootstrap_recovered,
            tracking_active,
            geolocation_denied,
            candidate_area,
            popup_visible,
            notifications_enabled,
            notification_permission,
            last_shown_reminder_id,
            telemetry_buffer_path,
            telemetry_queue_depth,
            config,
        }
    }
}
