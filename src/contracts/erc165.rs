use ethers::prelude::abigen;

abigen!(
    IERC165,
    r#"[
        function supportsInterface(bytes4 interfaceId) external view returns (bool)
    ]"#
);
