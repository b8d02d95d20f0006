// claim.rs - ClaimCodec: wire-level claim parsing and the channel-claim digest
//
// A claim is the off-chain, signed statement that lets the receiver of a
// payment channel redeem the sender's escrow on-chain at any time. The
// digest construction below must be bit-exact with the on-chain contract:
//
//   inner  = soliditySha3(contractAddress: address, channelId: bytes32, value: uint256)
//   prefix = "\x19Ethereum Signed Message:\n32"
//   digest = keccak256(prefix || inner)
//
// The parse_* helpers and the hex-prefix stripping convention for
// signature bytes follow the wider codebase's address/hash parsing style.

use alloy::primitives::{keccak256, Address, Signature, B256, U256};
use alloy::signers::{local::PrivateKeySigner, Signer};
use std::str::FromStr;

use crate::error::SettlementError;

/// A wire-level claim, as carried by the `machinomy` BTP sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub channel_id: B256,
    pub contract_address: Address,
    pub value: U256,
    pub signature: Signature,
}

/// JSON shape of the `machinomy` sub-protocol payload (all fields strings).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClaimMessage {
    pub channel_id: String,
    pub contract_address: String,
    pub value: String,
    pub signature: String,
}

impl Claim {
    /// Parse a wire `ClaimMessage`, validating shape but not signature/value semantics.
    pub fn parse(msg: &ClaimMessage) -> Result<Self, SettlementError> {
        let channel_id = parse_b256(&msg.channel_id)?;
        let contract_address = parse_address(&msg.contract_address)?;
        let value = parse_u256(&msg.value)?;
        let signature = parse_signature(&msg.signature)?;
        Ok(Claim {
            channel_id,
            contract_address,
            value,
            signature,
        })
    }

    /// Serialize back to the wire shape. `parse(serialize(c)) == c` for all
    /// syntactically valid claims (round-trip law, spec.md §8).
    pub fn to_message(&self) -> ClaimMessage {
        ClaimMessage {
            channel_id: format!("0x{:x}", self.channel_id),
            contract_address: format!("0x{:x}", self.contract_address),
            value: self.value.to_string(),
            signature: format!("0x{}", hex::encode(self.signature.as_bytes())),
        }
    }

    /// The digest this claim's signature covers.
    pub fn digest(&self) -> B256 {
        channel_claim_digest(self.contract_address, self.channel_id, self.value)
    }

    /// Recover the address that signed this claim.
    pub fn recover_signer(&self) -> Result<Address, SettlementError> {
        self.signature
            .recover_address_from_prehash(&self.digest())
            .map_err(|_| SettlementError::InvalidClaimSignature)
    }

    /// Verify this claim was signed by `expected_signer`.
    pub fn verify(&self, expected_signer: Address) -> bool {
        matches!(self.recover_signer(), Ok(signer) if signer == expected_signer)
    }
}

/// Compute the channel-claim digest for a given contract/channel/value triple.
///
/// `soliditySha3(address, bytes32, uint256)` is simple concatenation of the
/// ABI-packed encodings (no padding beyond each type's own width) followed
/// by keccak256; the Ethereum personal-message prefix is then applied.
pub fn channel_claim_digest(contract_address: Address, channel_id: B256, value: U256) -> B256 {
    let mut inner = Vec::with_capacity(20 + 32 + 32);
    inner.extend_from_slice(contract_address.as_slice());
    inner.extend_from_slice(channel_id.as_slice());
    inner.extend_from_slice(&value.to_be_bytes::<32>());
    let inner_hash = keccak256(&inner);

    let mut prefixed = Vec::with_capacity(28 + 32);
    prefixed.extend_from_slice(b"\x19Ethereum Signed Message:\n32");
    prefixed.extend_from_slice(inner_hash.as_slice());
    keccak256(&prefixed)
}

/// Sign a claim digest with our private key, producing a ready-to-send `Claim`.
pub async fn sign_claim(
    wallet: &PrivateKeySigner,
    contract_address: Address,
    channel_id: B256,
    value: U256,
) -> Result<Claim, SettlementError> {
    let digest = channel_claim_digest(contract_address, channel_id, value);
    let signature = wallet
        .sign_hash(&digest)
        .await
        .map_err(|e| SettlementError::Internal(format!("claim signing failed: {}", e)))?;
    Ok(Claim {
        channel_id,
        contract_address,
        value,
        signature,
    })
}

pub fn parse_address(input: &str) -> Result<Address, SettlementError> {
    Address::from_str(input).map_err(|_| SettlementError::InvalidAddress(input.to_string()))
}

pub fn parse_b256(input: &str) -> Result<B256, SettlementError> {
    B256::from_str(input).map_err(|_| SettlementError::Internal(format!("invalid channel id: {}", input)))
}

pub fn parse_u256(input: &str) -> Result<U256, SettlementError> {
    U256::from_str(input).map_err(|_| SettlementError::Internal(format!("invalid uint256: {}", input)))
}

pub fn parse_signature(input: &str) -> Result<Signature, SettlementError> {
    let trimmed = input.strip_prefix("0x").unwrap_or(input);
    let bytes = hex::decode(trimmed)
        .map_err(|e| SettlementError::Internal(format!("invalid signature hex: {}", e)))?;
    Signature::try_from(bytes.as_slice())
        .map_err(|e| SettlementError::Internal(format!("invalid signature format: {}", e)))
}

/// Pick a fresh, unused channel id for an outgoing `open` call.
pub fn random_channel_id() -> B256 {
    let mut bytes = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    B256::from(bytes)
}

/// gwei -> wei
pub fn gwei_to_wei(gwei: u64) -> U256 {
    U256::from(gwei) * U256::from(1_000_000_000u64)
}

/// wei -> gwei, floored (spec.md §4.4/§4.5: amounts below 1 gwei vanish).
pub fn wei_to_gwei_floor(wei: U256) -> u64 {
    (wei / U256::from(1_000_000_000u64)).to::<u64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, b256};

    fn test_wallet() -> PrivateKeySigner {
        PrivateKeySigner::random()
    }

    #[tokio::test]
    async fn round_trips_through_wire_format() {
        let wallet = test_wallet();
        let contract = address!("0000000000000000000000000000000000000002");
        let channel_id = b256!("0000000000000000000000000000000000000000000000000000000000000001");
        let claim = sign_claim(&wallet, contract, channel_id, U256::from(500_000u64))
            .await
            .unwrap();

        let msg = claim.to_message();
        let parsed = Claim::parse(&msg).unwrap();
        assert_eq!(parsed, claim);
    }

    #[tokio::test]
    async fn verify_succeeds_for_correct_signer_and_fails_for_another() {
        let wallet = test_wallet();
        let other = test_wallet();
        let contract = address!("0000000000000000000000000000000000000002");
        let channel_id = b256!("0000000000000000000000000000000000000000000000000000000000000001");
        let claim = sign_claim(&wallet, contract, channel_id, U256::from(10u64))
            .await
            .unwrap();

        assert!(claim.verify(wallet.address()));
        assert!(!claim.verify(other.address()));
    }

    #[tokio::test]
    async fn higher_spent_claim_supersedes_prior_and_is_independently_valid() {
        let wallet = test_wallet();
        let contract = address!("0000000000000000000000000000000000000002");
        let channel_id = b256!("0000000000000000000000000000000000000000000000000000000000000001");

        let first = sign_claim(&wallet, contract, channel_id, U256::from(100u64))
            .await
            .unwrap();
        let second = sign_claim(&wallet, contract, channel_id, U256::from(250u64))
            .await
            .unwrap();

        assert!(first.verify(wallet.address()));
        assert!(second.verify(wallet.address()));
        assert!(second.value > first.value);
    }

    #[test]
    fn wei_gwei_conversions_floor_correctly() {
        assert_eq!(wei_to_gwei_floor(U256::from(500_000u64)), 0);
        assert_eq!(wei_to_gwei_floor(U256::from(10_000_000_000u64)), 10);
        assert_eq!(gwei_to_wei(1), U256::from(1_000_000_000u64));
    }
}
