pub mod conversation;
pub mod frames;
pub mod message;

pub use conversation::{
    Conversation, ConversationPage, CreateConversationRequest, ListConversationsQuery,
    SearchConversationsQuery,
};
pub use frames::{
    ActivityKind, ChatFrame, DeliveryEnvelope, DeliveryFrame, ErrorCode, FrameError, InboundFrame, OutboundFrame,
    SearchFrame,
};
pub use message::{GetMessagesQuery, Message, MessageRole, NewMessage, SendMessageRequest};

/// Free-form metadata attached to conversations and messages.
pub type Metadata = serde_json::Map<String, serde_json::Value>;
