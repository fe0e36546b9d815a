use ethers::types::H256;
use ethers::utils::keccak256;
use once_cell::sync::Lazy;

/// `Transfer(address,address,uint256)`, shared by ERC-20 and ERC-721.
pub static TRANSFER_TOPIC: Lazy<H256> =
    Lazy::new(|| H256::from(keccak256("Transfer(address,address,uint256)")));

/// `TransferSingle(address,address,address,uint256,uint256)` (ERC-1155).
pub static TRANSFER_SINGLE_TOPIC: Lazy<H256> = Lazy::new(|| {
    H256::from(keccak256(
        "TransferSingle(address,address,address,uint256,uint256)",
    ))
});

/// `TransferBatch(address,address,address,uint256[],uint256[])` (ERC-1155).
pub static TRANSFER_BATCH_TOPIC: Lazy<H256> = Lazy::new(|| {
    H256::from(keccak256(
        "TransferBatch(address,address,address,uint256[],uint256[])",
    ))
});

pub const ERC721_INTERFACE_ID: [u8; 4] = [0x80, 0xac, 0x58, 0xcd];
pub const ERC1155_INTERFACE_ID: [u8; 4] = [0xd9, 0xb6, 0x7a, 0x26];
