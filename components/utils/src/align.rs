// Copyright 2024 trunkfs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Round `length` up to the next multiple of `alignment`. An alignment of
/// 0 or 1 leaves the length unchanged.
pub fn align_up(length: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return length;
    }
    ((length + alignment - 1) / alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(100, 0), 100);
        assert_eq!(align_up(100, 1), 100);
        // Non power of two alignments work too.
        assert_eq!(align_up(100, 24), 120);
    }
}
