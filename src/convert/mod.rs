//! Message conversion between Slack's wire formats (mrkdwn, Block Kit) and
//! Matrix's `m.room.message` events, in both directions.

pub mod blocks;
pub mod matrix_to_slack;
pub mod mrkdwn;
pub mod slack_to_matrix;

pub use matrix_to_slack::{MatrixToSlackConverter, SlackFileUpload, SlackSendPlan, SlackTextOptions};
pub use slack_to_matrix::{ConversionResult, ConvertedPart, SlackToMatrixConverter};
