// Contracts Module - token standard ABIs used for probing

pub mod erc165;
pub mod erc20;
pub mod events;

pub use erc165::{IERC165, SupportsInterfaceCall};
pub use erc20::{BalanceOfCall, IERC20};
pub use events::{
    ERC1155_INTERFACE_ID, ERC721_INTERFACE_ID, TRANSFER_BATCH_TOPIC, TRANSFER_SINGLE_TOPIC,
    TRANSFER_TOPIC,
};
