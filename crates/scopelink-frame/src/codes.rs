//! Command code registry.
//!
//! Codes are opaque integers assigned by the controller firmware. Requests
//! and their replies share a code; notifications use codes the client never
//! sends.

/// Move an axis to an absolute position (`int32Data0` = axis, value = target).
pub const STAGE_POSITION_SET: u32 = 0x6005;

/// Read an axis position (`int32Data0` = axis).
pub const STAGE_POSITION_GET: u32 = 0x6008;

/// Notification: a stage move finished.
pub const STAGE_MOTION_STOPPED: u32 = 0x6010;

/// Read the controller state string.
pub const SYSTEM_STATE_GET: u32 = 0x1001;

/// Notification: the controller changed state.
pub const SYSTEM_STATE_CHANGED: u32 = 0x1003;

/// Start the loaded workflow.
pub const WORKFLOW_START: u32 = 0x3001;

/// Abort the running workflow.
pub const WORKFLOW_STOP: u32 = 0x3002;

/// Notification: the running workflow finished.
pub const WORKFLOW_COMPLETE: u32 = 0x3010;

/// Set a laser line power level (`int32Data0` = line, value = percent).
pub const LASER_LEVEL_SET: u32 = 0x4001;

/// Read the camera exposure time in milliseconds.
pub const CAMERA_EXPOSURE_GET: u32 = 0x5002;

/// Notification: hardware fault, description in the buffer.
pub const ERROR_NOTIFICATION: u32 = 0x7001;

/// Codes the controller emits on its own initiative.
pub const UNSOLICITED_CODES: &[u32] = &[
    STAGE_MOTION_STOPPED,
    SYSTEM_STATE_CHANGED,
    WORKFLOW_COMPLETE,
    ERROR_NOTIFICATION,
];

/// Returns a human-readable name for a command code.
pub fn code_name(code: u32) -> &'static str {
    match code {
        STAGE_POSITION_SET => "STAGE_POSITION_SET",
        STAGE_POSITION_GET => "STAGE_POSITION_GET",
        STAGE_MOTION_STOPPED => "STAGE_MOTION_STOPPED",
        SYSTEM_STATE_GET => "SYSTEM_STATE_GET",
        SYSTEM_STATE_CHANGED => "SYSTEM_STATE_CHANGED",
        WORKFLOW_START => "WORKFLOW_START",
        WORKFLOW_STOP => "WORKFLOW_STOP",
        WORKFLOW_COMPLETE => "WORKFLOW_COMPLETE",
        LASER_LEVEL_SET => "LASER_LEVEL_SET",
        CAMERA_EXPOSURE_GET => "CAMERA_EXPOSURE_GET",
        ERROR_NOTIFICATION => "ERROR_NOTIFICATION",
        _ => "UNKNOWN",
    }
}

/// Returns true if the code is a controller-initiated notification.
pub fn is_unsolicited(code: u32) -> bool {
    UNSOLICITED_CODES.contains(&code)
}
