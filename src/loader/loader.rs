use std::fs;
use std::io::ErrorKind;

use regex::Regex;
use thiserror::Error;

use crate::cpu::CPUConfig;
use crate::instructions::instructions::{get_opcode, Instr, mnemonic, Operand, operand_format, Program, RegisterType, WordType};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{0}")]
    ParseError(String),

    #[error("{}", .0.join("\n"))]
    AnalysisError(Vec<String>),

    #[error("{0}")]
    NotFoundError(String),

    #[error("{0}")]
    IOError(String),
}

struct Loader {
    cpu_config: CPUConfig,
    separator: Regex,
    register: Regex,
    immediate: Regex,
    code: Vec<Instr>,
    errors: Vec<String>,
}

impl Loader {
    fn new(cpu_config: CPUConfig) -> Result<Loader, LoadError> {
        let compile = |pattern: &str| Regex::new(pattern).map_err(|err| LoadError::ParseError(err.to_string()));

        Ok(Loader {
            cpu_config,
            separator: compile(r"[,\s]+")?,
            register: compile(r"^(?i)R(\d+)$")?,
            immediate: compile(r"^#([+-]?)(0[xX][0-9a-fA-F]+|0[oO][0-7]+|0[bB][01]+|\d+)$")?,
            code: Vec::new(),
            errors: Vec::new(),
        })
    }

    fn load(mut self, src: &str) -> Result<Program, LoadError> {
        for (line_index, line) in src.lines().enumerate() {
            self.parse_line(line_index + 1, line);
        }

        if self.code.is_empty() && self.errors.is_empty() {
            self.errors.push("The program contains no instructions".to_string());
        }

        if !self.errors.is_empty() {
            return Err(LoadError::AnalysisError(self.errors));
        }

        Ok(Program::new(self.code))
    }

    fn parse_line(&mut self, line_nr: usize, line: &str) {
        let text = match line.find(';') {
            Some(comment) => &line[..comment],
            None => line,
        };

        let tokens: Vec<&str> = self.separator.split(text.trim())
            .filter(|token| !token.is_empty())
            .collect();
        let (name, operands) = match tokens.split_first() {
            Some((name, operands)) => (*name, operands),
            None => return,
        };

        let opcode = match get_opcode(name) {
            Some(opcode) => opcode,
            None => {
                self.errors.push(format!("Unknown mnemonic '{}' at line {}", name, line_nr));
                return;
            }
        };

        let format = operand_format(opcode);
        if operands.len() != format.len() {
            self.errors.push(format!("{} expects {} operands but found {} at line {}",
                                     mnemonic(opcode), format.len(), operands.len(), line_nr));
            return;
        }

        let mut instr = Instr::new(opcode);
        let error_count = self.errors.len();
        for (kind, text) in format.iter().zip(operands.iter()) {
            match kind {
                Operand::Imm => {
                    if let Some(imm) = self.parse_immediate(text, line_nr) {
                        instr.imm = imm;
                    }
                }
                Operand::Dest => instr.rd = self.parse_register(text, line_nr),
                Operand::Src1 => instr.rs1 = self.parse_register(text, line_nr),
                Operand::Src2 => instr.rs2 = self.parse_register(text, line_nr),
                Operand::Src3 => instr.rs3 = self.parse_register(text, line_nr),
            }
        }

        if self.errors.len() == error_count {
            self.code.push(instr);
        }
    }

    fn parse_register(&mut self, text: &str, line_nr: usize) -> Option<RegisterType> {
        let reg = self.register.captures(text)
            .and_then(|captures| captures[1].parse::<RegisterType>().ok())
            .filter(|reg| *reg < self.cpu_config.arch_reg_count);

        if reg.is_none() {
            self.errors.push(format!("Illegal register '{}' at line {}; expected R0..R{}",
                                     text, line_nr, self.cpu_config.arch_reg_count.saturating_sub(1)));
        }
        reg
    }

    fn parse_immediate(&mut self, text: &str, line_nr: usize) -> Option<WordType> {
        let value = self.immediate.captures(text).and_then(|captures| {
            let digits = &captures[2];
            let magnitude = match digits.get(..2).map(|prefix| prefix.to_ascii_lowercase()) {
                Some(prefix) if prefix == "0x" => i64::from_str_radix(&digits[2..], 16),
                Some(prefix) if prefix == "0o" => i64::from_str_radix(&digits[2..], 8),
                Some(prefix) if prefix == "0b" => i64::from_str_radix(&digits[2..], 2),
                _ => digits.parse::<i64>(),
            }.ok()?;
            let value = if &captures[1] == "-" { -magnitude } else { magnitude };
            WordType::try_from(value).ok()
        });

        if value.is_none() {
            self.errors.push(format!("Illegal immediate '{}' at line {}", text, line_nr));
        }
        value
    }
}

pub fn load(cpu_config: CPUConfig, path: &str) -> Result<Program, LoadError> {
    let src = fs::read_to_string(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => LoadError::NotFoundError(format!("File '{}' not found", path)),
        _ => LoadError::IOError(format!("Failed to read '{}': {}", path, err)),
    })?;

    load_from_string(cpu_config, src)
}

pub fn load_from_string(cpu_config: CPUConfig, src: String) -> Result<Program, LoadError> {
    Loader::new(cpu_config)?.load(&src)
}
