pub mod botnet;
