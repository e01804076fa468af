use crate::abi::account::{EXECUTE, GET_ENTRY_POINT, GET_NONCE, OWNER, VALIDATE_USER_OP};
use crate::abi::Method;
use crate::error::Revert;
use crate::ledger::{is_mutating, unknown_selector, Frame, Ledger};
use crate::user_op::{SIG_VALIDATION_FAILED, SIG_VALIDATION_SUCCESS};
use ethers::abi::Token;
use ethers::types::{Address, Bytes, RecoveryMessage, Signature, H256, U256};

const MUTATORS: &[&Method] = &[&EXECUTE, &VALIDATE_USER_OP];

/// ERC-4337 smart-contract wallet.
///
/// `owner` and `entry_point` are fixed at deployment. Every state-changing
/// call routed through the account must come from one of the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartAccount {
    owner: Address,
    entry_point: Address,
    nonce: U256,
}

impl SmartAccount {
    pub fn new(owner: Address, entry_point: Address) -> Self {
        Self {
            owner,
            entry_point,
            nonce: U256::zero(),
        }
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn nonce(&self) -> U256 {
        self.nonce
    }

    pub fn require_owner_or_entry_point(&self, caller: Address) -> Result<(), Revert> {
        if caller == self.owner || caller == self.entry_point {
            Ok(())
        } else {
            Err(Revert::NotFromEntryPointOrOwner)
        }
    }

    pub fn require_entry_point(&self, caller: Address) -> Result<(), Revert> {
        if caller == self.entry_point {
            Ok(())
        } else {
            Err(Revert::NotFromEntryPoint)
        }
    }

    /// Signer of the EIP-191 personal-sign digest of `op_hash`.
    pub fn recover_signer(op_hash: H256, signature: &[u8]) -> Option<Address> {
        let sig = Signature::try_from(signature).ok()?;
        sig.recover(RecoveryMessage::Data(op_hash.as_bytes().to_vec()))
            .ok()
    }

    pub fn check_signature(&self, op_hash: H256, signature: &[u8]) -> bool {
        Self::recover_signer(op_hash, signature) == Some(self.owner)
    }

    /// Compare-and-increment. Returns false (and leaves the nonce alone) when
    /// `expected` is not the current value.
    pub fn use_nonce(&mut self, expected: U256) -> bool {
        if expected != self.nonce {
            return false;
        }
        self.nonce += U256::one();
        true
    }
}

pub(crate) fn view(account: &SmartAccount, data: &[u8]) -> Result<Bytes, Revert> {
    if data.is_empty() {
        return Ok(Bytes::default());
    }
    if is_mutating(MUTATORS, data) {
        return Err(Revert::StaticCallViolation);
    }

    if OWNER.matches(data) {
        Ok(OWNER.encode_output(&[Token::Address(account.owner)]))
    } else if GET_ENTRY_POINT.matches(data) {
        Ok(GET_ENTRY_POINT.encode_output(&[Token::Address(account.entry_point)]))
    } else if GET_NONCE.matches(data) {
        Ok(GET_NONCE.encode_output(&[Token::Uint(account.nonce)]))
    } else {
        Err(unknown_selector(data))
    }
}

pub(crate) fn handle(ledger: &mut Ledger, frame: &Frame, data: &[u8]) -> Result<Bytes, Revert> {
    // receive()
    if data.is_empty() {
        return Ok(Bytes::default());
    }
    if !frame.value.is_zero() {
        return Err(Revert::NonPayable);
    }

    if EXECUTE.matches(data) {
        execute(ledger, frame, data)
    } else if VALIDATE_USER_OP.matches(data) {
        validate_user_op(ledger, frame, data)
    } else {
        let account = ledger.account_mut(frame.address)?;
        view(account, data)
    }
}

fn execute(ledger: &mut Ledger, frame: &Frame, data: &[u8]) -> Result<Bytes, Revert> {
    ledger
        .account_mut(frame.address)?
        .require_owner_or_entry_point(frame.caller)?;

    let mut args = EXECUTE.decode_call(data)?;
    let (target, value, inner) = (args.address()?, args.uint()?, args.bytes()?);

    tracing::debug!(account = ?frame.address, target = ?target, value = %value, "execute");
    let ret = ledger.message_call(frame.address, target, value, &inner)?;
    Ok(EXECUTE.encode_output(&[Token::Bytes(ret.to_vec())]))
}

fn validate_user_op(ledger: &mut Ledger, frame: &Frame, data: &[u8]) -> Result<Bytes, Revert> {
    let available = ledger.balance(frame.address);
    let account = ledger.account_mut(frame.address)?;
    account.require_entry_point(frame.caller)?;

    let mut args = VALIDATE_USER_OP.decode_call(data)?;
    let (op, op_hash, missing) = (args.user_op()?, args.bytes32()?, args.uint()?);

    if !account.check_signature(op_hash, &op.signature) {
        tracing::warn!(account = ?frame.address, op_hash = ?op_hash, "signature does not recover to owner");
        return Ok(status(SIG_VALIDATION_FAILED));
    }
    let current = account.nonce;
    if !account.use_nonce(op.nonce) {
        tracing::warn!(account = ?frame.address, expected = %current, got = %op.nonce, "stale or future nonce");
        return Ok(status(SIG_VALIDATION_FAILED));
    }
    // a revert from here on restores the nonce along with the rest of the call
    if available < missing {
        return Err(Revert::InsufficientPrefund { missing, available });
    }

    let entry_point = account.entry_point;
    if !missing.is_zero() {
        ledger.message_call(frame.address, entry_point, missing, &[])?;
    }

    tracing::debug!(account = ?frame.address, nonce = %op.nonce, prefund = %missing, "user operation validated");
    Ok(status(SIG_VALIDATION_SUCCESS))
}

fn status(code: u64) -> Bytes {
    VALIDATE_USER_OP.encode_output(&[Token::Uint(U256::from(code))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{account as account_abi, factory as factory_abi, token as token_abi};
    use crate::user_op::UserOperation;
    use ethers::signers::{LocalWallet, Signer};

    const OWNER_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const CHAIN_ID: u64 = 31337;

    struct Setup {
        ledger: Ledger,
        wallet: LocalWallet,
        entry_point: Address,
        account: Address,
        token: Address,
    }

    fn setup() -> Setup {
        let wallet: LocalWallet = OWNER_KEY.parse().unwrap();
        let owner = wallet.address();
        let deployer = Address::repeat_byte(0xd0);
        let entry_point = Address::repeat_byte(0xe0);

        let mut ledger = Ledger::new();
        let factory = ledger.deploy_factory(deployer, entry_point, Bytes::from_static(b"\x60\x80"));
        let token = ledger.deploy_token(deployer, "Cash", "CASH");

        let out = ledger
            .call(owner, factory, U256::zero(), &factory_abi::create_account(owner, U256::zero()))
            .unwrap();
        let account = factory_abi::CREATE_ACCOUNT
            .decode_output(&out)
            .unwrap()
            .address()
            .unwrap();

        ledger
            .call(deployer, token, U256::zero(), &token_abi::mint(account, U256::from(100u64)))
            .unwrap();

        Setup {
            ledger,
            wallet,
            entry_point,
            account,
            token,
        }
    }

    fn token_balance(s: &Setup, holder: Address) -> U256 {
        s.ledger.token(s.token).unwrap().balance_of(holder)
    }

    async fn signed_op(s: &Setup, nonce: U256) -> (UserOperation, H256) {
        let mut op = UserOperation {
            sender: s.account,
            nonce,
            call_data: account_abi::execute(
                s.token,
                U256::zero(),
                token_abi::transfer(Address::repeat_byte(0x0b), U256::one()),
            ),
            ..Default::default()
        };
        let hash = op.hash(s.entry_point, CHAIN_ID);
        let sig = s.wallet.sign_message(hash.as_bytes()).await.unwrap();
        op.signature = Bytes::from(sig.to_vec());
        (op, hash)
    }

    fn validate(s: &mut Setup, op: &UserOperation, hash: H256, missing: U256) -> Result<U256, Revert> {
        let out = s.ledger.call(
            s.entry_point,
            s.account,
            U256::zero(),
            &account_abi::validate_user_op(op, hash, missing),
        )?;
        VALIDATE_USER_OP.decode_output(&out)?.uint()
    }

    #[test]
    fn owner_executes_token_transfer() {
        let mut s = setup();
        let other = Address::repeat_byte(0x0b);
        let call = account_abi::execute(s.token, U256::zero(), token_abi::transfer(other, U256::one()));

        s.ledger
            .call(s.wallet.address(), s.account, U256::zero(), &call)
            .unwrap();
        assert_eq!(token_balance(&s, s.account), U256::from(99u64));
        assert_eq!(token_balance(&s, other), U256::one());
    }

    #[test]
    fn stranger_cannot_execute() {
        let mut s = setup();
        let other = Address::repeat_byte(0x0b);
        let call = account_abi::execute(s.token, U256::zero(), token_abi::transfer(other, U256::one()));

        let err = s
            .ledger
            .call(Address::repeat_byte(0x66), s.account, U256::zero(), &call)
            .unwrap_err();
        assert_eq!(err, Revert::NotFromEntryPointOrOwner);
        assert_eq!(token_balance(&s, s.account), U256::from(100u64));
        assert_eq!(token_balance(&s, other), U256::zero());
    }

    #[test]
    fn entry_point_may_execute() {
        let mut s = setup();
        let call = account_abi::execute(
            s.token,
            U256::zero(),
            token_abi::transfer(Address::repeat_byte(0x0b), U256::from(5u64)),
        );
        s.ledger
            .call(s.entry_point, s.account, U256::zero(), &call)
            .unwrap();
        assert_eq!(token_balance(&s, s.account), U256::from(95u64));
    }

    #[test]
    fn callee_revert_rolls_everything_back() {
        let mut s = setup();
        let logs_before = s.ledger.logs().len();
        let call = account_abi::execute(
            s.token,
            U256::zero(),
            token_abi::transfer(Address::repeat_byte(0x0b), U256::from(101u64)),
        );
        let err = s
            .ledger
            .call(s.wallet.address(), s.account, U256::zero(), &call)
            .unwrap_err();
        assert!(matches!(err, Revert::Erc20InsufficientBalance { .. }));
        assert_eq!(token_balance(&s, s.account), U256::from(100u64));
        assert_eq!(s.ledger.logs().len(), logs_before);
    }

    #[tokio::test]
    async fn valid_op_validates_once() {
        let mut s = setup();
        let (op, hash) = signed_op(&s, U256::zero()).await;

        assert_eq!(validate(&mut s, &op, hash, U256::zero()).unwrap(), U256::zero());
        assert_eq!(s.ledger.account(s.account).unwrap().nonce(), U256::one());

        // Replay of the same op is stale now.
        assert_eq!(validate(&mut s, &op, hash, U256::zero()).unwrap(), U256::one());
        assert_eq!(s.ledger.account(s.account).unwrap().nonce(), U256::one());
    }

    #[tokio::test]
    async fn wrong_signer_is_rejected_without_state_change() {
        let mut s = setup();
        let (mut op, hash) = signed_op(&s, U256::zero()).await;
        let stranger: LocalWallet = "0101010101010101010101010101010101010101010101010101010101010101"
            .parse()
            .unwrap();
        op.signature = Bytes::from(stranger.sign_message(hash.as_bytes()).await.unwrap().to_vec());

        s.ledger.fund(s.account, U256::from(10u64));
        assert_eq!(validate(&mut s, &op, hash, U256::from(10u64)).unwrap(), U256::one());
        assert_eq!(s.ledger.account(s.account).unwrap().nonce(), U256::zero());
        assert_eq!(s.ledger.balance(s.account), U256::from(10u64));
    }

    #[tokio::test]
    async fn garbage_signature_is_a_validation_failure() {
        let mut s = setup();
        let (mut op, hash) = signed_op(&s, U256::zero()).await;
        op.signature = Bytes::from(vec![0xffu8; 12]);
        assert_eq!(validate(&mut s, &op, hash, U256::zero()).unwrap(), U256::one());
    }

    #[tokio::test]
    async fn only_entry_point_validates() {
        let mut s = setup();
        let (op, hash) = signed_op(&s, U256::zero()).await;
        let err = s
            .ledger
            .call(
                s.wallet.address(),
                s.account,
                U256::zero(),
                &account_abi::validate_user_op(&op, hash, U256::zero()),
            )
            .unwrap_err();
        assert_eq!(err, Revert::NotFromEntryPoint);
    }

    #[tokio::test]
    async fn prefund_is_paid_to_entry_point() {
        let mut s = setup();
        s.ledger.fund(s.account, U256::from(1_000u64));
        let (op, hash) = signed_op(&s, U256::zero()).await;

        assert_eq!(validate(&mut s, &op, hash, U256::from(300u64)).unwrap(), U256::zero());
        assert_eq!(s.ledger.balance(s.account), U256::from(700u64));
        assert_eq!(s.ledger.balance(s.entry_point), U256::from(300u64));
    }

    #[tokio::test]
    async fn prefund_shortfall_reverts() {
        let mut s = setup();
        s.ledger.fund(s.account, U256::from(5u64));
        let (op, hash) = signed_op(&s, U256::zero()).await;

        let err = validate(&mut s, &op, hash, U256::from(6u64)).unwrap_err();
        assert_eq!(
            err,
            Revert::InsufficientPrefund {
                missing: U256::from(6u64),
                available: U256::from(5u64),
            }
        );
        assert_eq!(s.ledger.account(s.account).unwrap().nonce(), U256::zero());
        assert_eq!(s.ledger.balance(s.account), U256::from(5u64));
    }

    #[test]
    fn receive_accepts_value_and_views_report_state() {
        let mut s = setup();
        let owner = s.wallet.address();
        s.ledger.fund(owner, U256::from(50u64));
        s.ledger
            .call(owner, s.account, U256::from(20u64), &[])
            .unwrap();
        assert_eq!(s.ledger.balance(s.account), U256::from(20u64));

        let out = s
            .ledger
            .static_call(owner, s.account, &OWNER.encode_call(&[]))
            .unwrap();
        assert_eq!(OWNER.decode_output(&out).unwrap().address().unwrap(), owner);

        let out = s
            .ledger
            .static_call(owner, s.account, &GET_ENTRY_POINT.encode_call(&[]))
            .unwrap();
        assert_eq!(
            GET_ENTRY_POINT.decode_output(&out).unwrap().address().unwrap(),
            s.entry_point
        );
    }

    #[test]
    fn execute_under_static_call_is_rejected() {
        let s = setup();
        let call = account_abi::execute(s.token, U256::zero(), Bytes::default());
        assert_eq!(
            s.ledger.static_call(s.wallet.address(), s.account, &call),
            Err(Revert::StaticCallViolation)
        );
    }

    #[tokio::test]
    async fn future_nonce_is_rejected_and_nonce_kept() {
        let mut s = setup();
        let (op, hash) = signed_op(&s, U256::from(1u64)).await;
        assert_eq!(validate(&mut s, &op, hash, U256::zero()).unwrap(), U256::one());
        assert_eq!(s.ledger.account(s.account).unwrap().nonce(), U256::zero());

        let (op, hash) = signed_op(&s, U256::zero()).await;
        assert_eq!(validate(&mut s, &op, hash, U256::zero()).unwrap(), U256::zero());
        assert_eq!(s.ledger.account(s.account).unwrap().nonce(), U256::one());
    }

    #[test]
    fn execute_forwards_native_value() {
        let mut s = setup();
        let dest = Address::repeat_byte(0x0d);
        s.ledger.fund(s.account, U256::from(10u64));
        let owner = s.wallet.address();

        let call = account_abi::execute(dest, U256::from(4u64), Bytes::default());
        s.ledger.call(owner, s.account, U256::zero(), &call).unwrap();
        assert_eq!(s.ledger.balance(s.account), U256::from(6u64));
        assert_eq!(s.ledger.balance(dest), U256::from(4u64));

        let overdraw = account_abi::execute(dest, U256::from(7u64), Bytes::default());
        let err = s.ledger.call(owner, s.account, U256::zero(), &overdraw).unwrap_err();
        assert_eq!(
            err,
            Revert::InsufficientNativeBalance {
                account: s.account,
                balance: U256::from(6u64),
                needed: U256::from(7u64),
            }
        );
        assert_eq!(s.ledger.balance(s.account), U256::from(6u64));
        assert_eq!(s.ledger.balance(dest), U256::from(4u64));
    }

    #[test]
    fn execute_returns_callee_data() {
        let mut s = setup();
        let call = account_abi::execute(s.token, U256::zero(), token_abi::balance_of(s.account));

        let out = s
            .ledger
            .call(s.wallet.address(), s.account, U256::zero(), &call)
            .unwrap();
        let inner = EXECUTE.decode_output(&out).unwrap().bytes().unwrap();
        let balance = token_abi::BALANCE_OF.decode_output(&inner).unwrap().uint().unwrap();
        assert_eq!(balance, U256::from(100u64));
    }

    #[test]
    fn use_nonce_is_compare_and_increment() {
        let mut account = SmartAccount::new(Address::repeat_byte(1), Address::repeat_byte(2));
        assert!(!account.use_nonce(U256::one()));
        assert!(account.use_nonce(U256::zero()));
        assert!(!account.use_nonce(U256::zero()));
        assert_eq!(account.nonce(), U256::one());
    }
}
