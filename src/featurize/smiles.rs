//! SMILES parsing into an atom graph
//!
//! Supports the organic subset, aromatic atoms, bracket atoms (isotope,
//! chirality, hydrogen count, charge, atom class), the bond symbols
//! `- = # : / \`, branches, ring closures (`1`..`9` and `%nn`) and `.`
//! disconnections. Explicit hydrogen atoms bonded to a heavy atom are folded
//! into that atom's hydrogen count.

use std::collections::{BTreeMap, VecDeque};

use crate::error::{MolPropError, Result};

/// Largest hydrogen count accepted inside a bracket atom
const MAX_BRACKET_H: u8 = 16;

const ELEMENTS: [&str; 118] = [
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S", "Cl",
    "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As",
    "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In",
    "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm", "Sm", "Eu", "Gd", "Tb",
    "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl",
    "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac", "Th", "Pa", "U", "Np", "Pu", "Am", "Cm", "Bk",
    "Cf", "Es", "Fm", "Md", "No", "Lr", "Rf", "Db", "Sg", "Bh", "Hs", "Mt", "Ds", "Rg", "Cn", "Nh",
    "Fl", "Mc", "Lv", "Ts", "Og",
];

fn atomic_number(symbol: &str) -> Option<u8> {
    ELEMENTS
        .iter()
        .position(|&e| e == symbol)
        .map(|i| (i + 1) as u8)
}

/// Default valences used to infer implicit hydrogens on organic-subset atoms
fn default_valences(atomic_number: u8) -> &'static [u8] {
    match atomic_number {
        5 => &[3],
        6 => &[4],
        7 => &[3, 5],
        8 => &[2],
        15 => &[3, 5],
        16 => &[2, 4, 6],
        9 | 17 | 35 | 53 => &[1],
        _ => &[],
    }
}

/// Tetrahedral chirality marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chirality {
    /// `@`
    CounterClockwise,
    /// `@@`
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondOrder {
    Single,
    Double,
    Triple,
    Aromatic,
}

impl BondOrder {
    fn from_symbol(c: char) -> Option<Self> {
        match c {
            '-' | '/' | '\\' => Some(BondOrder::Single),
            '=' => Some(BondOrder::Double),
            '#' => Some(BondOrder::Triple),
            ':' => Some(BondOrder::Aromatic),
            _ => None,
        }
    }

    /// Contribution to the valence, in half-bonds
    fn half_valence(&self) -> u32 {
        match self {
            BondOrder::Single => 2,
            BondOrder::Double => 4,
            BondOrder::Triple => 6,
            BondOrder::Aromatic => 3,
        }
    }

    pub fn code(&self) -> u64 {
        match self {
            BondOrder::Single => 1,
            BondOrder::Double => 2,
            BondOrder::Triple => 3,
            BondOrder::Aromatic => 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    pub atomic_number: u8,
    pub aromatic: bool,
    pub isotope: Option<u16>,
    pub charge: i8,
    pub chirality: Option<Chirality>,
    /// Hydrogens written in a bracket atom, `None` for organic-subset atoms
    explicit_h: Option<u8>,
    /// Hydrogens contributed by folded explicit hydrogen atoms
    folded_h: u8,
}

impl Atom {
    fn organic(atomic_number: u8, aromatic: bool) -> Self {
        Self {
            atomic_number,
            aromatic,
            isotope: None,
            charge: 0,
            chirality: None,
            explicit_h: None,
            folded_h: 0,
        }
    }

    fn is_plain_hydrogen(&self) -> bool {
        self.atomic_number == 1 && self.isotope.is_none() && self.charge == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bond {
    pub a: usize,
    pub b: usize,
    pub order: BondOrder,
}

/// Parsed molecule
#[derive(Debug, Clone, PartialEq)]
pub struct MolGraph {
    atoms: Vec<Atom>,
    bonds: Vec<Bond>,
}

impl MolGraph {
    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn bonds(&self) -> &[Bond] {
        &self.bonds
    }

    pub fn n_atoms(&self) -> usize {
        self.atoms.len()
    }

    /// `(neighbor, bond order)` pairs per atom
    pub fn adjacency(&self) -> Vec<Vec<(usize, BondOrder)>> {
        let mut adjacency = vec![Vec::new(); self.atoms.len()];
        for bond in &self.bonds {
            adjacency[bond.a].push((bond.b, bond.order));
            adjacency[bond.b].push((bond.a, bond.order));
        }
        adjacency
    }

    /// Total hydrogen count of an atom (explicit, folded and implicit)
    pub fn total_h(&self, idx: usize) -> u8 {
        let atom = &self.atoms[idx];
        if let Some(h) = atom.explicit_h {
            return h.saturating_add(atom.folded_h);
        }
        let half: u32 = self
            .bonds
            .iter()
            .filter(|b| b.a == idx || b.b == idx)
            .map(|b| b.order.half_valence())
            .sum::<u32>()
            + 2 * atom.folded_h as u32;
        let used = (half + 1) / 2;
        let implicit = default_valences(atom.atomic_number)
            .iter()
            .map(|&v| v as u32)
            .find(|&v| v >= used)
            .map_or(0, |v| v - used);
        (implicit as u8).saturating_add(atom.folded_h)
    }

    /// Whether each atom lies on at least one cycle
    pub fn ring_membership(&self) -> Vec<bool> {
        let mut in_ring = vec![false; self.atoms.len()];
        for (skip, bond) in self.bonds.iter().enumerate() {
            if in_ring[bond.a] && in_ring[bond.b] {
                continue;
            }
            if self.connected_without(bond.a, bond.b, skip) {
                in_ring[bond.a] = true;
                in_ring[bond.b] = true;
            }
        }
        in_ring
    }

    /// Whether `from` reaches `to` when bond `skip` is removed
    fn connected_without(&self, from: usize, to: usize, skip: usize) -> bool {
        let mut seen = vec![false; self.atoms.len()];
        let mut queue = VecDeque::from([from]);
        seen[from] = true;
        while let Some(node) = queue.pop_front() {
            if node == to {
                return true;
            }
            for (i, bond) in self.bonds.iter().enumerate() {
                if i == skip {
                    continue;
                }
                let next = if bond.a == node {
                    bond.b
                } else if bond.b == node {
                    bond.a
                } else {
                    continue;
                };
                if !seen[next] {
                    seen[next] = true;
                    queue.push_back(next);
                }
            }
        }
        false
    }
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    source: &'a str,
    atoms: Vec<Atom>,
    bonds: Vec<Bond>,
    rings: BTreeMap<u32, (usize, Option<BondOrder>)>,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            source,
            atoms: Vec::new(),
            bonds: Vec::new(),
            rings: BTreeMap::new(),
        }
    }

    fn error(&self, reason: impl Into<String>) -> MolPropError {
        MolPropError::FeaturizationError {
            identifier: self.source.to_string(),
            reason: format!("{} at position {}", reason.into(), self.pos),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    /// Digits at the cursor, `None` when there are none
    fn read_number(&mut self) -> Result<Option<u32>> {
        let start = self.pos;
        while self.peek().map_or(false, |c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Ok(None);
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        digits
            .parse()
            .map(Some)
            .map_err(|_| self.error(format!("number {} out of range", digits)))
    }

    fn add_bond(&mut self, a: usize, b: usize, order: Option<BondOrder>) -> Result<()> {
        if a == b {
            return Err(self.error("atom bonded to itself"));
        }
        if self.bonds.iter().any(|x| (x.a == a && x.b == b) || (x.a == b && x.b == a)) {
            return Err(self.error("duplicate bond"));
        }
        let order = order.unwrap_or(if self.atoms[a].aromatic && self.atoms[b].aromatic {
            BondOrder::Aromatic
        } else {
            BondOrder::Single
        });
        self.bonds.push(Bond { a, b, order });
        Ok(())
    }

    fn organic_atom(&mut self) -> Result<Atom> {
        let c = self.bump().ok_or_else(|| self.error("expected atom"))?;
        let (symbol, aromatic) = match c {
            'C' if self.peek() == Some('l') => {
                self.pos += 1;
                ("Cl", false)
            }
            'B' if self.peek() == Some('r') => {
                self.pos += 1;
                ("Br", false)
            }
            'B' => ("B", false),
            'C' => ("C", false),
            'N' => ("N", false),
            'O' => ("O", false),
            'P' => ("P", false),
            'S' => ("S", false),
            'F' => ("F", false),
            'I' => ("I", false),
            'H' => ("H", false),
            'b' => ("B", true),
            'c' => ("C", true),
            'n' => ("N", true),
            'o' => ("O", true),
            'p' => ("P", true),
            's' => ("S", true),
            other => {
                self.pos -= 1;
                return Err(self.error(format!("unexpected character '{}'", other)));
            }
        };
        let z = atomic_number(symbol).ok_or_else(|| self.error("unknown element"))?;
        Ok(Atom::organic(z, aromatic))
    }

    fn bracket_atom(&mut self) -> Result<Atom> {
        self.bump();
        let isotope = match self.read_number()? {
            Some(n) => Some(u16::try_from(n).map_err(|_| self.error(format!("isotope {} out of range", n)))?),
            None => None,
        };

        let first = self.bump().ok_or_else(|| self.error("unterminated bracket atom"))?;
        let (z, aromatic) = if first.is_ascii_lowercase() {
            let mut symbol = first.to_ascii_uppercase().to_string();
            if let Some(next) = self.peek().filter(|c| c.is_ascii_lowercase()) {
                let two = format!("{}{}", symbol, next);
                if matches!(two.as_str(), "Se" | "As" | "Te") {
                    self.pos += 1;
                    symbol = two;
                }
            }
            (atomic_number(&symbol), true)
        } else if first.is_ascii_uppercase() {
            let mut symbol = first.to_string();
            if let Some(next) = self.peek().filter(|c| c.is_ascii_lowercase()) {
                let two = format!("{}{}", first, next);
                if atomic_number(&two).is_some() {
                    self.pos += 1;
                    symbol = two;
                }
            }
            (atomic_number(&symbol), false)
        } else {
            (None, false)
        };
        let z = z.ok_or_else(|| self.error(format!("unknown element '{}'", first)))?;

        let mut chirality = None;
        if self.peek() == Some('@') {
            self.pos += 1;
            chirality = Some(Chirality::CounterClockwise);
            if self.peek() == Some('@') {
                self.pos += 1;
                chirality = Some(Chirality::Clockwise);
            }
        }

        let mut explicit_h = 0u8;
        if self.peek() == Some('H') {
            self.pos += 1;
            let count = self.read_number()?.unwrap_or(1);
            explicit_h = u8::try_from(count)
                .ok()
                .filter(|&h| h <= MAX_BRACKET_H)
                .ok_or_else(|| self.error(format!("hydrogen count {} out of range", count)))?;
        }

        let mut charge: i32 = 0;
        while let Some(sign @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let unit = if sign == '+' { 1 } else { -1 };
            let magnitude = i32::try_from(self.read_number()?.unwrap_or(1)).unwrap_or(i32::MAX);
            charge = magnitude
                .checked_mul(unit)
                .and_then(|delta| charge.checked_add(delta))
                .filter(|c| i8::try_from(*c).is_ok())
                .ok_or_else(|| self.error("charge out of range"))?;
        }
        let charge = charge as i8;

        if self.peek() == Some(':') {
            self.pos += 1;
            self.read_number()?.ok_or_else(|| self.error("expected atom class"))?;
        }

        if self.bump() != Some(']') {
            return Err(self.error("expected ']'"));
        }

        Ok(Atom {
            atomic_number: z,
            aromatic,
            isotope,
            charge,
            chirality,
            explicit_h: Some(explicit_h),
            folded_h: 0,
        })
    }

    fn parse(mut self) -> Result<MolGraph> {
        if self.chars.is_empty() {
            return Err(self.error("empty identifier"));
        }

        let mut prev: Option<usize> = None;
        let mut branches: Vec<Option<usize>> = Vec::new();
        let mut pending_bond: Option<BondOrder> = None;

        while let Some(c) = self.peek() {
            match c {
                '(' => {
                    if prev.is_none() {
                        return Err(self.error("branch without a preceding atom"));
                    }
                    self.pos += 1;
                    branches.push(prev);
                }
                ')' => {
                    self.pos += 1;
                    if pending_bond.is_some() {
                        return Err(self.error("bond without a following atom"));
                    }
                    prev = branches.pop().ok_or_else(|| self.error("unbalanced ')'"))?;
                }
                '.' => {
                    self.pos += 1;
                    if pending_bond.is_some() {
                        return Err(self.error("bond before '.'"));
                    }
                    prev = None;
                }
                '-' | '=' | '#' | ':' | '/' | '\\' => {
                    if pending_bond.is_some() {
                        return Err(self.error("consecutive bond symbols"));
                    }
                    self.pos += 1;
                    pending_bond = BondOrder::from_symbol(c);
                }
                '%' | '0'..='9' => {
                    let current = prev.ok_or_else(|| self.error("ring closure without an atom"))?;
                    let number = if c == '%' {
                        self.pos += 1;
                        let start = self.pos;
                        let digits: String = self.chars.iter().skip(start).take(2).collect();
                        if digits.len() != 2 || !digits.chars().all(|d| d.is_ascii_digit()) {
                            return Err(self.error("expected two digits after '%'"));
                        }
                        self.pos += 2;
                        digits.parse().unwrap_or(0)
                    } else {
                        self.pos += 1;
                        c.to_digit(10).unwrap_or(0)
                    };

                    match self.rings.remove(&number) {
                        Some((other, opening_bond)) => {
                            let order = match (opening_bond, pending_bond) {
                                (Some(a), Some(b)) if a != b => {
                                    return Err(self.error("conflicting ring closure bonds"))
                                }
                                (a, b) => a.or(b),
                            };
                            self.add_bond(other, current, order)?;
                        }
                        None => {
                            self.rings.insert(number, (current, pending_bond));
                        }
                    }
                    pending_bond = None;
                }
                _ => {
                    let atom = if c == '[' {
                        self.bracket_atom()?
                    } else {
                        self.organic_atom()?
                    };
                    self.atoms.push(atom);
                    let idx = self.atoms.len() - 1;
                    if let Some(p) = prev {
                        self.add_bond(p, idx, pending_bond.take())?;
                    } else if pending_bond.is_some() {
                        return Err(self.error("bond without a preceding atom"));
                    }
                    prev = Some(idx);
                }
            }
        }

        if pending_bond.is_some() {
            return Err(self.error("dangling bond"));
        }
        if !branches.is_empty() {
            return Err(self.error("unclosed branch"));
        }
        if let Some(number) = self.rings.keys().next() {
            return Err(self.error(format!("unclosed ring {}", number)));
        }
        if self.atoms.is_empty() {
            return Err(self.error("no atoms"));
        }

        Ok(fold_hydrogens(MolGraph {
            atoms: self.atoms,
            bonds: self.bonds,
        }))
    }
}

/// Remove plain hydrogen atoms attached to a heavy atom, counting them on the neighbor
fn fold_hydrogens(graph: MolGraph) -> MolGraph {
    let adjacency = graph.adjacency();
    let removable: Vec<bool> = graph
        .atoms
        .iter()
        .enumerate()
        .map(|(i, atom)| {
            atom.is_plain_hydrogen()
                && adjacency[i].len() == 1
                && adjacency[i][0].1 == BondOrder::Single
                && graph.atoms[adjacency[i][0].0].atomic_number != 1
        })
        .collect();
    if !removable.iter().any(|&r| r) {
        return graph;
    }

    let mut atoms = graph.atoms;
    for (i, &remove) in removable.iter().enumerate() {
        if remove {
            let heavy = adjacency[i][0].0;
            atoms[heavy].folded_h = atoms[heavy].folded_h.saturating_add(1);
        }
    }

    let mut new_index = vec![usize::MAX; atoms.len()];
    let mut kept = Vec::with_capacity(atoms.len());
    for (i, atom) in atoms.into_iter().enumerate() {
        if !removable[i] {
            new_index[i] = kept.len();
            kept.push(atom);
        }
    }
    let bonds = graph
        .bonds
        .into_iter()
        .filter(|b| !removable[b.a] && !removable[b.b])
        .map(|b| Bond {
            a: new_index[b.a],
            b: new_index[b.b],
            order: b.order,
        })
        .collect();

    MolGraph { atoms: kept, bonds }
}

/// Parse a SMILES string
pub fn parse_smiles(smiles: &str) -> Result<MolGraph> {
    Parser::new(smiles.trim()).parse()
}
