//! Action merkle tree: pairwise sha256 over the action receipt digests of a
//! block, odd nodes carried up unpaired.

use sha2::{Digest as _, Sha256};

use crate::types::Digest;

pub fn hash(bytes: &[u8]) -> Digest {
	Digest(Sha256::digest(bytes).into())
}

fn combine(left: &Digest, right: &Digest) -> Digest {
	let mut hasher = Sha256::new();
	hasher.update(left.0);
	hasher.update(right.0);
	Digest(hasher.finalize().into())
}

/// Folds the leaf digests up to the root. An empty leaf set folds to the
/// zero digest (a block that executed no actions).
pub fn merkle_root(leaves: &[Digest]) -> Digest {
	if leaves.is_empty() {
		return Digest::default()
	}
	let mut layer = leaves.to_vec();
	while layer.len() > 1 {
		layer = layer
			.chunks(2)
			.map(|pair| match pair {
				[left, right] => combine(left, right),
				[odd] => *odd,
				_ => unreachable!(),
			})
			.collect();
	}
	layer[0]
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_set_folds_to_zero() {
		assert_eq!(merkle_root(&[]), Digest::default());
	}

	#[test]
	fn single_leaf_is_its_own_root() {
		let leaf = hash(b"only");
		assert_eq!(merkle_root(&[leaf]), leaf);
	}

	#[test]
	fn pair_combines_in_order() {
		let (a, b) = (hash(b"a"), hash(b"b"));
		assert_eq!(merkle_root(&[a, b]), combine(&a, &b));
		assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
	}

	#[test]
	fn odd_leaf_is_carried_up() {
		let (a, b, c) = (hash(b"a"), hash(b"b"), hash(b"c"));
		assert_eq!(merkle_root(&[a, b, c]), combine(&combine(&a, &b), &c));
	}

	#[test]
	fn root_is_sensitive_to_every_leaf() {
		let leaves: Vec<Digest> = (0u8..7).map(|i| hash(&[i])).collect();
		let root = merkle_root(&leaves);
		for i in 0..leaves.len() {
			let mut tampered = leaves.clone();
			tampered[i] = hash(b"tampered");
			assert_ne!(merkle_root(&tampered), root);
		}
	}
}
