pub mod fs;

/// Transmutes a signed/unsigned integer into its opposite unsigned/signed
/// counterpart while preserving the underlying bit pattern.
///
/// Used at the edges of the on-disk log format, where lengths and offsets
/// are carried as unsigned values on disk but are easier to do checked
/// arithmetic on as signed values in memory.
pub trait FlipSign<T> {
	fn flip(self) -> T;
}

impl FlipSign<u16> for i16 { fn flip(self) -> u16 { self as u16 } }
impl FlipSign<i16> for u16 { fn flip(self) -> i16 { self as i16 } }
impl FlipSign<u32> for i32 { fn flip(self) -> u32 { self as u32 } }
impl FlipSign<i32> for u32 { fn flip(self) -> i32 { self as i32 } }
impl FlipSign<u64> for i64 { fn flip(self) -> u64 { self as u64 } }
impl FlipSign<i64> for u64 { fn flip(self) -> i64 { self as i64 } }

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flip_sign_round_trips() {
		let a: i64 = -1;
		let b: u64 = a.flip();
		assert_eq!(b, u64::MAX);
		assert_eq!(b.flip(), a);
	}
}
