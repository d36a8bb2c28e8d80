//! Reading recorded velocity commands out of ROS 2 bags.
mod bag;
pub mod record;

pub use bag::{BagReader, RawMessage, StorageError, TopicInfo};
pub use record::{decode_twist, encode_twist, ByteOrder, DecodeError, MIN_RECORD_LEN};
